//! Concurrent per-campaign hopper.
//!
//! Each campaign owns one `parking_lot::Mutex` around its entries; popping,
//! releasing and expiring all take that lock, so a lead can never be handed
//! to two dialers. The campaign map itself is a `DashMap`, keeping campaigns
//! independent of each other.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::types::{CampaignId, LeadId};

/// Whether an entry can be handed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Available,
    Dialing { since: DateTime<Utc> },
}

/// Lead reference held in the hopper
#[derive(Debug, Clone, PartialEq)]
pub struct HopperEntry {
    pub lead_id: LeadId,
    pub campaign_id: CampaignId,
    pub phone_number: String,
    pub state: EntryState,
    pub inserted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CampaignHopper {
    entries: HashMap<LeadId, HopperEntry>,
    /// Insertion order, which is refill priority order
    order: VecDeque<LeadId>,
}

impl CampaignHopper {
    fn forget(&mut self, lead_id: LeadId) -> Option<HopperEntry> {
        let entry = self.entries.remove(&lead_id)?;
        self.order.retain(|id| *id != lead_id);
        Some(entry)
    }
}

#[derive(Default)]
pub struct HopperStore {
    campaigns: DashMap<CampaignId, Arc<Mutex<CampaignHopper>>>,
}

impl HopperStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn campaign(&self, campaign_id: CampaignId) -> Arc<Mutex<CampaignHopper>> {
        self.campaigns.entry(campaign_id).or_default().clone()
    }

    fn existing(&self, campaign_id: CampaignId) -> Option<Arc<Mutex<CampaignHopper>>> {
        self.campaigns.get(&campaign_id).map(|hopper| hopper.value().clone())
    }

    /// Add a lead as available. Returns `false` if the lead already has an
    /// entry in any state.
    pub fn insert(
        &self,
        campaign_id: CampaignId,
        lead_id: LeadId,
        phone_number: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let hopper = self.campaign(campaign_id);
        let mut hopper = hopper.lock();
        if hopper.entries.contains_key(&lead_id) {
            return false;
        }
        hopper.entries.insert(
            lead_id,
            HopperEntry {
                lead_id,
                campaign_id,
                phone_number: phone_number.to_string(),
                state: EntryState::Available,
                inserted_at: now,
            },
        );
        hopper.order.push_back(lead_id);
        true
    }

    /// Take up to `n` available leads, marking each one dialing
    pub fn pop_candidates(
        &self,
        campaign_id: CampaignId,
        n: usize,
        now: DateTime<Utc>,
    ) -> Vec<HopperEntry> {
        if n == 0 {
            return Vec::new();
        }
        let hopper = self.campaign(campaign_id);
        let mut hopper = hopper.lock();
        let CampaignHopper { entries, order } = &mut *hopper;

        let mut popped = Vec::with_capacity(n);
        for lead_id in order.iter() {
            if popped.len() == n {
                break;
            }
            if let Some(entry) = entries.get_mut(lead_id) {
                if entry.state == EntryState::Available {
                    entry.state = EntryState::Dialing { since: now };
                    popped.push(entry.clone());
                }
            }
        }
        popped
    }

    /// Available entries waiting to be dialed
    pub fn peek_count(&self, campaign_id: CampaignId) -> usize {
        let Some(hopper) = self.existing(campaign_id) else {
            return 0;
        };
        let count = hopper
            .lock()
            .entries
            .values()
            .filter(|e| e.state == EntryState::Available)
            .count();
        count
    }

    /// Every entry of the campaign, available or dialing
    pub fn len(&self, campaign_id: CampaignId) -> usize {
        let Some(hopper) = self.existing(campaign_id) else {
            return 0;
        };
        let len = hopper.lock().entries.len();
        len
    }

    /// Return a dialing entry to available. It keeps its place in line.
    pub fn release(&self, campaign_id: CampaignId, lead_id: LeadId) -> bool {
        let Some(hopper) = self.existing(campaign_id) else {
            return false;
        };
        let mut hopper = hopper.lock();
        match hopper.entries.get_mut(&lead_id) {
            Some(entry) if matches!(entry.state, EntryState::Dialing { .. }) => {
                entry.state = EntryState::Available;
                true
            }
            _ => false,
        }
    }

    /// The dial attempt reached an outcome; drop the entry
    pub fn complete(&self, campaign_id: CampaignId, lead_id: LeadId) -> bool {
        let Some(hopper) = self.existing(campaign_id) else {
            return false;
        };
        let removed = hopper.lock().forget(lead_id).is_some();
        removed
    }

    /// Drop a lead from every campaign hopper (e.g. it became DNC)
    pub fn remove_lead(&self, lead_id: LeadId) -> bool {
        let hoppers: Vec<_> = self.campaigns.iter().map(|h| h.value().clone()).collect();
        let mut removed = false;
        for hopper in hoppers {
            removed |= hopper.lock().forget(lead_id).is_some();
        }
        removed
    }

    /// Return entries dialing for longer than `max_age` to available,
    /// skipping leads `in_use` still claims. Returns the leads released.
    pub fn expire_stale<F>(
        &self,
        campaign_id: CampaignId,
        max_age: Duration,
        now: DateTime<Utc>,
        in_use: F,
    ) -> Vec<LeadId>
    where
        F: Fn(LeadId) -> bool,
    {
        let Some(hopper) = self.existing(campaign_id) else {
            return Vec::new();
        };
        let cutoff = now - max_age;
        let mut hopper = hopper.lock();
        let mut released = Vec::new();
        for entry in hopper.entries.values_mut() {
            if let EntryState::Dialing { since } = entry.state {
                if since <= cutoff && !in_use(entry.lead_id) {
                    entry.state = EntryState::Available;
                    released.push(entry.lead_id);
                }
            }
        }
        released
    }

    /// Drop available entries older than `ttl` so refill can refetch them
    /// with fresh status
    pub fn purge_expired(&self, campaign_id: CampaignId, ttl: Duration, now: DateTime<Utc>) -> usize {
        let Some(hopper) = self.existing(campaign_id) else {
            return 0;
        };
        let cutoff = now - ttl;
        let mut hopper = hopper.lock();
        let expired: Vec<LeadId> = hopper
            .entries
            .values()
            .filter(|e| e.state == EntryState::Available && e.inserted_at <= cutoff)
            .map(|e| e.lead_id)
            .collect();
        for lead_id in &expired {
            hopper.forget(*lead_id);
        }
        expired.len()
    }

    pub fn state_of(&self, campaign_id: CampaignId, lead_id: LeadId) -> Option<EntryState> {
        let hopper = self.existing(campaign_id)?;
        let state = hopper.lock().entries.get(&lead_id).map(|e| e.state);
        state
    }

    pub fn contains(&self, campaign_id: CampaignId, lead_id: LeadId) -> bool {
        self.state_of(campaign_id, lead_id).is_some()
    }
}
