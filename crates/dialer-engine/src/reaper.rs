//! Session reaper.
//!
//! A low-frequency sweep that closes what the event flow could not: agents
//! whose client went silent, logins whose agent leg never came up, sessions
//! stuck on a call long past any plausible talk time, and wrap-ups past their
//! deadline. It also settles customer attempts that never got a hangup event
//! and runs the configured lead recycle rules.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agent::session::{AgentSession, SessionState};
use crate::database::leads::LeadStatus;
use crate::engine::DialerEngine;
use crate::error::{DialerError, Result};
use crate::gateway::with_timeout;
use crate::orchestrator::calls::{terminal_linger, AttemptState};
use crate::types::{CallId, CampaignId};

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReaperReport {
    pub heartbeat_expired: usize,
    pub connecting_expired: usize,
    pub stuck_closed: usize,
    pub wrapups_completed: usize,
    pub lost_calls: usize,
    pub orphaned_calls: usize,
    pub leads_recycled: u64,
    pub attempts_purged: usize,
    pub sessions_evicted: usize,
}

impl ReaperReport {
    pub fn is_empty(&self) -> bool {
        *self == ReaperReport::default()
    }
}

impl DialerEngine {
    pub async fn run_reaper_sweep(&self) -> Result<ReaperReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the clock read `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<ReaperReport> {
        let mut report = ReaperReport::default();
        let cfg = &self.config.reaper;
        let heartbeat_timeout = Duration::seconds(cfg.heartbeat_timeout_secs as i64);
        let connecting_timeout = Duration::seconds(cfg.connecting_timeout_secs as i64);
        let stuck_window = Duration::seconds(cfg.stuck_session_secs as i64);

        for session in self.sessions.live_sessions() {
            let agent_id = &session.agent_id;
            let in_state = now - session.state_since;

            if now - session.last_heartbeat > heartbeat_timeout {
                warn!("💀 Agent {} missed its heartbeat, closing session", agent_id);
                if self
                    .teardown_session(agent_id, SessionState::Offline, "heartbeat timeout")
                    .await
                    .is_some()
                {
                    report.heartbeat_expired += 1;
                }
                continue;
            }

            match session.state {
                SessionState::Connecting if in_state > connecting_timeout => {
                    warn!("⏰ Agent leg of {} never came up", agent_id);
                    if self
                        .teardown_session(agent_id, SessionState::Error, "agent leg never answered")
                        .await
                        .is_some()
                    {
                        report.connecting_expired += 1;
                    }
                }
                SessionState::OnCall | SessionState::Wrapup if in_state > stuck_window => {
                    let reason = format!("stuck in {} for {}s", session.state, in_state.num_seconds());
                    warn!("🧟 Session of {} {}", agent_id, reason);
                    if self
                        .teardown_session(agent_id, SessionState::Error, &reason)
                        .await
                        .is_some()
                    {
                        report.stuck_closed += 1;
                    }
                }
                SessionState::Wrapup
                    if session.wrapup_until.map_or(true, |until| until <= now) =>
                {
                    if self.expire_wrapup(&session, now).await {
                        report.wrapups_completed += 1;
                    }
                }
                _ => {}
            }
        }

        report.lost_calls = self.settle_lost_calls(now).await;
        report.orphaned_calls = self.settle_orphaned_calls(now).await;
        report.leads_recycled = match self.apply_recycle_rules(now).await {
            Ok(moved) => moved,
            Err(e) => {
                warn!("Lead recycling failed: {}", e);
                0
            }
        };
        report.attempts_purged = self.calls.purge_terminal(now - terminal_linger());
        report.sessions_evicted = self
            .sessions
            .evict_closed(now - Duration::seconds(cfg.closed_session_retention_secs as i64));

        if report.is_empty() {
            debug!("🧹 Reaper sweep found nothing to do");
        } else {
            info!("🧹 Reaper sweep: {:?}", report);
        }
        Ok(report)
    }

    /// Wrap-up deadline passed: file the campaign's automatic disposition
    /// if the agent filed none, then go back to ready with the availability
    /// flag untouched.
    async fn expire_wrapup(&self, session: &AgentSession, now: DateTime<Utc>) -> bool {
        let agent_id = &session.agent_id;

        if let Some(call) = &session.last_call {
            if let Err(e) = self.auto_disposition(session.campaign_id, call.call_id, now).await {
                warn!("Auto wrap-up disposition for call {} failed: {}", call.call_id, e);
            }
        }

        let Some(ready) = self
            .sessions
            .complete_call_work(agent_id, None, session.available, now)
        else {
            return false;
        };
        info!("⏲️ Wrap-up of {} timed out, back to ready", agent_id);

        if ready.logout_requested {
            self.teardown_session(agent_id, SessionState::Offline, "logout")
                .await;
        } else {
            self.session_changed(&ready, Some("wrap-up timeout".to_string()))
                .await;
        }
        true
    }

    async fn auto_disposition(
        &self,
        campaign_id: CampaignId,
        call_id: CallId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(campaign) = self.db.get_campaign(campaign_id).await? else {
            return Ok(());
        };
        let Some(code) = campaign.auto_wrapup_disposition.as_deref() else {
            return Ok(());
        };
        let Some(record) = self.db.get_call_record(call_id).await? else {
            return Ok(());
        };
        if record.disposition.is_some() {
            return Ok(());
        }
        let disposition = self
            .db
            .get_disposition(code)
            .await?
            .ok_or_else(|| DialerError::config(format!("auto wrap-up disposition '{}' not defined", code)))?;

        match self
            .record_disposition(&record, &disposition, Some("auto wrap-up"), None, now)
            .await
        {
            Ok(_) => {
                debug!("Call {} auto-dispositioned {}", call_id, code);
                Ok(())
            }
            // The agent got there first
            Err(DialerError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Attempts stuck before answer far past any ring timeout never got their
    /// hangup event. Count them as failed so the lead recycles.
    async fn settle_lost_calls(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(self.config.reaper.lost_call_secs as i64);
        let lost = self
            .calls
            .stale(&[AttemptState::Initiated, AttemptState::Ringing], cutoff);

        let mut settled = 0;
        for attempt in lost {
            warn!(
                "🕳️ Call {} to lead {} lost in {}, settling as failed",
                attempt.call_id, attempt.lead_id, attempt.state
            );
            if let Some(gateway) = self.gateways.get(&attempt.server_id) {
                self.hangup_customer(&gateway, &attempt.channel_id).await;
            }
            if self
                .settle_failed_attempt(
                    &attempt,
                    &[AttemptState::Initiated, AttemptState::Ringing],
                    LeadStatus::Failed,
                    "lost",
                )
                .await
            {
                self.hopper.complete(attempt.campaign_id, attempt.lead_id);
                settled += 1;
            }
        }
        settled
    }

    /// Matched or bridged calls that no live session holds any more. The
    /// channel is hung up if the server still has it, then the attempt is
    /// settled.
    async fn settle_orphaned_calls(&self, now: DateTime<Utc>) -> usize {
        let limit = self.config.matcher.command_timeout();
        let grace = Duration::from_std(limit).unwrap_or_else(|_| Duration::seconds(5));
        let candidates = self
            .calls
            .stale(&[AttemptState::Matched, AttemptState::Bridged], now - grace);

        let mut settled = 0;
        for attempt in candidates {
            let held = attempt
                .agent_id
                .as_ref()
                .and_then(|agent_id| self.sessions.get(agent_id))
                .map_or(false, |session| {
                    session.is_live()
                        && session
                            .current_call
                            .as_ref()
                            .map_or(false, |call| call.call_id == attempt.call_id)
                });
            if held {
                continue;
            }

            if let Some(gateway) = self.gateways.get(&attempt.server_id) {
                match with_timeout(limit, "channel_status", gateway.channel_status(&attempt.channel_id)).await {
                    Ok(Some(_)) => self.hangup_customer(&gateway, &attempt.channel_id).await,
                    Ok(None) => {}
                    Err(e) => debug!("Status of {} unknown: {}", attempt.channel_id, e),
                }
            }
            if self.settle_orphaned_call(&attempt, "session closed").await {
                settled += 1;
            }
        }
        settled
    }

    async fn apply_recycle_rules(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut total = 0;
        for rule in &self.config.recycle.rules {
            let called_before = now - Duration::seconds(rule.after_secs as i64);
            let moved = self
                .db
                .recycle_leads(rule.source_status, rule.target_status, called_before, rule.max_attempts)
                .await?;
            if moved > 0 {
                info!(
                    "♻️ Recycled {} lead(s) {} -> {}",
                    moved, rule.source_status, rule.target_status
                );
            }
            total += moved;
        }
        Ok(total)
    }
}
