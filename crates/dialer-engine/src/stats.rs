//! Per-campaign counters and the rolling abandon window that feeds the
//! ratio tuner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::scheduler::pacing::AbandonWindow;
use crate::types::CampaignId;

pub struct CampaignCounters {
    placed: AtomicU64,
    answered: AtomicU64,
    abandoned: AtomicU64,
    failed: AtomicU64,
    machine: AtomicU64,
    sales: AtomicU64,
    window: Mutex<AbandonWindow>,
}

impl CampaignCounters {
    fn new(window: Duration) -> Self {
        Self {
            placed: AtomicU64::new(0),
            answered: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            machine: AtomicU64::new(0),
            sales: AtomicU64::new(0),
            window: Mutex::new(AbandonWindow::new(window)),
        }
    }
}

/// Point-in-time counters of one campaign
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub calls_placed: u64,
    pub calls_answered: u64,
    pub calls_abandoned: u64,
    pub calls_failed: u64,
    pub machine_detected: u64,
    pub sales: u64,
    /// Answered calls inside the abandon window
    pub window_answered: usize,
    pub window_abandoned: usize,
    /// Percent, `None` with nothing answered in the window
    pub abandon_rate: Option<f64>,
}

/// Engine-wide snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialerStats {
    pub active_sessions: usize,
    pub ready_agents: usize,
    pub calls_in_flight: usize,
    pub campaigns: HashMap<CampaignId, CampaignStats>,
}

pub struct StatsRegistry {
    window: Duration,
    campaigns: DashMap<CampaignId, Arc<CampaignCounters>>,
}

impl StatsRegistry {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            campaigns: DashMap::new(),
        }
    }

    fn counters(&self, campaign_id: CampaignId) -> Arc<CampaignCounters> {
        self.campaigns
            .entry(campaign_id)
            .or_insert_with(|| Arc::new(CampaignCounters::new(self.window)))
            .clone()
    }

    pub fn record_placed(&self, campaign_id: CampaignId) {
        self.counters(campaign_id).placed.fetch_add(1, Ordering::Relaxed);
    }

    /// An answered call, and whether it was abandoned for want of an agent
    pub fn record_answer(&self, campaign_id: CampaignId, abandoned: bool, at: DateTime<Utc>) {
        let counters = self.counters(campaign_id);
        counters.answered.fetch_add(1, Ordering::Relaxed);
        if abandoned {
            counters.abandoned.fetch_add(1, Ordering::Relaxed);
        }
        counters.window.lock().record(at, abandoned);
    }

    pub fn record_failed(&self, campaign_id: CampaignId) {
        self.counters(campaign_id).failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_machine(&self, campaign_id: CampaignId) {
        self.counters(campaign_id).machine.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sale(&self, campaign_id: CampaignId) {
        self.counters(campaign_id).sales.fetch_add(1, Ordering::Relaxed);
    }

    pub fn abandon_rate(&self, campaign_id: CampaignId, now: DateTime<Utc>) -> Option<f64> {
        let counters = self.campaigns.get(&campaign_id).map(|c| c.value().clone())?;
        let rate = counters.window.lock().rate(now);
        rate
    }

    pub fn campaign(&self, campaign_id: CampaignId, now: DateTime<Utc>) -> CampaignStats {
        match self.campaigns.get(&campaign_id).map(|c| c.value().clone()) {
            Some(counters) => snapshot(&counters, now),
            None => CampaignStats::default(),
        }
    }

    pub fn all(&self, now: DateTime<Utc>) -> HashMap<CampaignId, CampaignStats> {
        let counters: Vec<(CampaignId, Arc<CampaignCounters>)> = self
            .campaigns
            .iter()
            .map(|c| (*c.key(), c.value().clone()))
            .collect();
        counters
            .into_iter()
            .map(|(id, c)| (id, snapshot(&c, now)))
            .collect()
    }
}

fn snapshot(counters: &CampaignCounters, now: DateTime<Utc>) -> CampaignStats {
    let mut window = counters.window.lock();
    let (window_answered, window_abandoned) = window.counts(now);
    CampaignStats {
        calls_placed: counters.placed.load(Ordering::Relaxed),
        calls_answered: counters.answered.load(Ordering::Relaxed),
        calls_abandoned: counters.abandoned.load(Ordering::Relaxed),
        calls_failed: counters.failed.load(Ordering::Relaxed),
        machine_detected: counters.machine.load(Ordering::Relaxed),
        sales: counters.sales.load(Ordering::Relaxed),
        window_answered,
        window_abandoned,
        abandon_rate: window.rate(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_rate() {
        let stats = StatsRegistry::new(Duration::seconds(3600));
        let now = Utc::now();
        assert_eq!(stats.abandon_rate(1, now), None);

        stats.record_placed(1);
        stats.record_placed(1);
        stats.record_answer(1, false, now);
        stats.record_answer(1, true, now);
        stats.record_answer(1, false, now);
        stats.record_answer(1, false, now);

        let snapshot = stats.campaign(1, now);
        assert_eq!(snapshot.calls_placed, 2);
        assert_eq!(snapshot.calls_answered, 4);
        assert_eq!(snapshot.calls_abandoned, 1);
        assert_eq!(snapshot.abandon_rate, Some(25.0));
        assert_eq!(stats.campaign(2, now), CampaignStats::default());
    }
}
