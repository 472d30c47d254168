//! # Dialer Engine
//!
//! [`DialerEngine`] owns every piece of shared state: the hopper, the agent
//! session registry, the in-flight call tracker, the counters and the
//! database handle. The scheduler, the per-server event workers and the
//! reaper each hold an `Arc<DialerEngine>` and never talk to each other
//! directly; they only meet in this state, and every mutation of it goes
//! through a per-key compare-and-swap.
//!
//! The behavior is split across modules, each adding an `impl DialerEngine`
//! block:
//!
//! - [`crate::agent`]: login, logout, heartbeat, availability
//! - [`crate::hopper`]: refill from the lead store
//! - [`crate::scheduler`]: pacing tick and origination
//! - [`crate::orchestrator`]: telephony events and call/agent matching
//! - [`crate::disposition`]: outcomes submitted by agents
//! - [`crate::reaper`]: timeouts and orphan cleanup
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use autodialer_engine::prelude::*;
//!
//! # async fn example() -> autodialer_engine::error::Result<()> {
//! let config = EngineConfig::for_testing();
//! let db = DatabaseManager::new_in_memory().await?;
//! let gateways = GatewayPool::from_config(&config.gateways)?;
//! let engine = Arc::new(DialerEngine::new(config, db, gateways, Arc::new(BroadcastNotifier::default())));
//!
//! let dialed = engine.run_scheduler_tick().await?;
//! println!("📞 {} call(s) placed", dialed);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agent::registry::SessionRegistry;
use crate::agent::session::SessionState;
use crate::config::EngineConfig;
use crate::database::campaigns::CampaignStatus;
use crate::database::DatabaseManager;
use crate::disposition::RecyclePolicy;
use crate::error::{DialerError, Result};
use crate::gateway::GatewayPool;
use crate::hopper::HopperStore;
use crate::notify::{Audience, DialerNotification, NotificationSink};
use crate::orchestrator::calls::CallTracker;
use crate::stats::{DialerStats, StatsRegistry};
use crate::types::CampaignId;

/// Health of a campaign as seen by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignHealth {
    pub healthy: bool,
    pub reason: Option<String>,
    pub since: DateTime<Utc>,
}

pub struct DialerEngine {
    pub(crate) config: EngineConfig,
    pub(crate) db: DatabaseManager,
    pub(crate) gateways: GatewayPool,
    pub(crate) hopper: HopperStore,
    pub(crate) sessions: SessionRegistry,
    pub(crate) calls: CallTracker,
    pub(crate) notifier: Arc<dyn NotificationSink>,
    pub(crate) stats: StatsRegistry,
    pub(crate) recycle: RecyclePolicy,
    pub(crate) health: DashMap<CampaignId, CampaignHealth>,
}

impl DialerEngine {
    pub fn new(
        config: EngineConfig,
        db: DatabaseManager,
        gateways: GatewayPool,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let stats = StatsRegistry::new(config.scheduler.abandon_window());
        let recycle = RecyclePolicy::from_config(&config.recycle);
        Self {
            config,
            db,
            gateways,
            hopper: HopperStore::new(),
            sessions: SessionRegistry::new(),
            calls: CallTracker::new(),
            notifier,
            stats,
            recycle,
            health: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.db
    }

    pub fn gateways(&self) -> &GatewayPool {
        &self.gateways
    }

    pub fn hopper(&self) -> &HopperStore {
        &self.hopper
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn calls(&self) -> &CallTracker {
        &self.calls
    }

    pub fn stats_registry(&self) -> &StatsRegistry {
        &self.stats
    }

    pub fn campaign_health(&self, campaign_id: CampaignId) -> Option<CampaignHealth> {
        self.health.get(&campaign_id).map(|h| h.clone())
    }

    /// Snapshot of sessions, calls in flight and campaign counters
    pub fn stats(&self) -> DialerStats {
        let now = Utc::now();
        let live = self.sessions.live_sessions();
        DialerStats {
            active_sessions: live.len(),
            ready_agents: live
                .iter()
                .filter(|s| s.state == SessionState::Ready)
                .count(),
            calls_in_flight: self.calls.total_in_flight(),
            campaigns: self.stats.all(now),
        }
    }

    /// Operator pause: no new originations, calls in flight finish
    pub async fn pause_campaign(&self, campaign_id: CampaignId, reason: Option<&str>) -> Result<()> {
        if !self
            .db
            .set_campaign_status(campaign_id, CampaignStatus::Paused, reason)
            .await?
        {
            return Err(DialerError::not_found(format!("campaign {}", campaign_id)));
        }
        info!("⏸️ Campaign {} paused", campaign_id);
        Ok(())
    }

    pub async fn resume_campaign(&self, campaign_id: CampaignId) -> Result<()> {
        if !self
            .db
            .set_campaign_status(campaign_id, CampaignStatus::Active, None)
            .await?
        {
            return Err(DialerError::not_found(format!("campaign {}", campaign_id)));
        }
        self.set_health(campaign_id, true, None);
        info!("▶️ Campaign {} resumed", campaign_id);
        Ok(())
    }

    /// The campaign cannot dial until an operator steps in
    pub(crate) async fn pause_unhealthy(&self, campaign_id: CampaignId, reason: &str) {
        warn!("🚨 Pausing campaign {}: {}", campaign_id, reason);
        if let Err(e) = self
            .db
            .set_campaign_status(campaign_id, CampaignStatus::Paused, Some(reason))
            .await
        {
            warn!("Failed to persist pause of campaign {}: {}", campaign_id, e);
        }
        self.set_health(campaign_id, false, Some(reason.to_string()));
    }

    fn set_health(&self, campaign_id: CampaignId, healthy: bool, reason: Option<String>) {
        let changed = self
            .health
            .get(&campaign_id)
            .map_or(!healthy, |h| h.healthy != healthy || h.reason != reason);

        self.health.insert(
            campaign_id,
            CampaignHealth {
                healthy,
                reason: reason.clone(),
                since: Utc::now(),
            },
        );

        if changed {
            self.notifier.publish(
                Audience::Campaign(campaign_id),
                DialerNotification::CampaignHealthChanged {
                    campaign_id,
                    healthy,
                    reason,
                },
            );
        }
    }
}
