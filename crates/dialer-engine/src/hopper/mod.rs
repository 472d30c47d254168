//! # Lead Hopper
//!
//! A short per-campaign queue of leads that may be dialed right now. The
//! scheduler refills it from the lead store and pops from it; a popped entry
//! stays in the hopper as `Dialing` until the attempt reaches an outcome, so
//! the same lead cannot be picked twice while a call to it is alive.
//!
//! Entries only ever leave through [`HopperStore::complete`],
//! [`HopperStore::remove_lead`] or TTL purging of `Available` entries. A
//! `Dialing` entry whose attempt vanished is returned to `Available` by
//! [`HopperStore::expire_stale`], so no lead stays stuck.

pub mod store;

pub use store::{EntryState, HopperEntry, HopperStore};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::database::campaigns::Campaign;
use crate::engine::DialerEngine;
use crate::error::Result;

impl DialerEngine {
    /// Top the campaign's hopper up to its configured size. Returns the
    /// number of leads added.
    pub async fn refill_hopper(&self, campaign: &Campaign, now: DateTime<Utc>) -> Result<usize> {
        let purged = self
            .hopper
            .purge_expired(campaign.id, self.config.scheduler.hopper_ttl(), now);
        if purged > 0 {
            debug!("Purged {} expired hopper entries of campaign {}", purged, campaign.id);
        }

        let size = campaign.hopper_size as usize;
        let current = self.hopper.len(campaign.id);
        if current >= size {
            return Ok(0);
        }

        // Leads already in the hopper come back from the query too
        let candidates = self
            .db
            .fetch_dialable_leads(campaign.id, campaign.max_attempts, now, size + current)
            .await?;

        let mut added = 0;
        for lead in candidates {
            if current + added >= size {
                break;
            }
            if self.hopper.contains(campaign.id, lead.id) {
                continue;
            }
            if !self.recycle.is_due(&lead, campaign, now) {
                continue;
            }
            if self.hopper.insert(campaign.id, lead.id, &lead.phone_number, now) {
                added += 1;
            }
        }

        if added > 0 {
            debug!(
                "🪣 Hopper of campaign {} refilled with {} lead(s) ({} total)",
                campaign.id,
                added,
                current + added
            );
        }
        Ok(added)
    }
}
