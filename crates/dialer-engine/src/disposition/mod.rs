//! # Dispositions
//!
//! After (or during) a call the agent files an outcome code. The code's
//! flags decide what happens to the lead and to the agent:
//!
//! - `triggers_dnc` puts the number on the internal do-not-call list and
//!   pulls the lead out of every hopper
//! - `triggers_callback` schedules the lead for the requested time, or for
//!   the code's default delay
//! - otherwise the lead takes the code's `lead_status`
//! - `is_sale` counts toward the campaign's sales
//! - `auto_available` sends the agent straight back to matching; without it
//!   the session returns to `ready` paused
//!
//! A call accepts one disposition. The second submission is refused.
//!
//! The [`RecyclePolicy`] decides when a lead that ended without a final
//! status may be dialed again.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agent::session::{AgentSession, SessionState};
use crate::config::RecycleConfig;
use crate::database::call_records::CallRecord;
use crate::database::campaigns::Campaign;
use crate::database::dispositions::Disposition;
use crate::database::leads::{Lead, LeadStatus};
use crate::engine::DialerEngine;
use crate::error::{DialerError, Result};
use crate::types::{AgentId, CallId};

/// Backoff between attempts on the same lead
#[derive(Debug, Clone, PartialEq)]
pub struct RecyclePolicy {
    pub backoff_multiplier: f64,
    pub max_retry_delay: Duration,
}

impl RecyclePolicy {
    pub fn from_config(config: &RecycleConfig) -> Self {
        Self {
            backoff_multiplier: config.backoff_multiplier,
            max_retry_delay: Duration::seconds(config.max_retry_delay_secs as i64),
        }
    }

    /// Delay before the next attempt after `attempts` calls:
    /// `base * multiplier^(attempts - 1)`, capped.
    pub fn retry_delay(&self, base_secs: u64, attempts: u32) -> Duration {
        if attempts == 0 || base_secs == 0 {
            return Duration::zero();
        }
        let factor = self.backoff_multiplier.max(1.0).powi(attempts as i32 - 1);
        let secs = (base_secs as f64 * factor).min(self.max_retry_delay.num_seconds() as f64);
        Duration::seconds(secs as i64)
    }

    /// Earliest time the lead may be dialed again, `None` if never
    pub fn next_dial_at(&self, lead: &Lead, campaign: &Campaign) -> Option<DateTime<Utc>> {
        match lead.status {
            LeadStatus::New => Some(DateTime::<Utc>::MIN_UTC),
            LeadStatus::Callback => Some(lead.callback_at.unwrap_or(DateTime::<Utc>::MIN_UTC)),
            status if status.is_recyclable() => {
                if lead.call_count >= campaign.max_attempts {
                    return None;
                }
                let last = lead.last_called_at?;
                Some(last + self.retry_delay(campaign.retry_delay_secs, lead.call_count))
            }
            _ => None,
        }
    }

    pub fn is_due(&self, lead: &Lead, campaign: &Campaign, now: DateTime<Utc>) -> bool {
        if lead.status == LeadStatus::New && lead.call_count >= campaign.max_attempts {
            return false;
        }
        match self.next_dial_at(lead, campaign) {
            Some(at) => at <= now,
            // Recyclable but never called: nothing to wait for
            None => {
                lead.status.is_recyclable()
                    && lead.last_called_at.is_none()
                    && lead.call_count < campaign.max_attempts
            }
        }
    }
}

impl Default for RecyclePolicy {
    fn default() -> Self {
        Self::from_config(&RecycleConfig::default())
    }
}

/// Outcome filed by an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispositionRequest {
    pub call_id: CallId,
    /// Disposition code, e.g. `SALE`
    pub disposition: String,
    #[serde(default)]
    pub notes: Option<String>,
    /// Explicit callback time for callback codes
    #[serde(default)]
    pub callback_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispositionResult {
    pub call_id: CallId,
    pub lead_status: LeadStatus,
    pub callback_at: Option<DateTime<Utc>>,
    /// The agent's session after the disposition, if it changed
    pub session: Option<AgentSession>,
}

impl DialerEngine {
    pub async fn submit_disposition(&self, request: DispositionRequest) -> Result<DispositionResult> {
        let now = Utc::now();
        let disposition = self
            .db
            .get_disposition(&request.disposition)
            .await?
            .ok_or_else(|| {
                DialerError::disposition(format!("unknown disposition code '{}'", request.disposition))
            })?;
        let record = self
            .db
            .get_call_record(request.call_id)
            .await?
            .ok_or_else(|| DialerError::not_found(format!("call {}", request.call_id)))?;

        if let Some(at) = request.callback_at {
            if !disposition.triggers_callback {
                return Err(DialerError::disposition(format!(
                    "disposition {} does not schedule callbacks",
                    disposition.code
                )));
            }
            if at < now {
                return Err(DialerError::disposition("callback time is in the past"));
            }
        }

        let (lead_status, callback_at) = self
            .record_disposition(
                &record,
                &disposition,
                request.notes.as_deref(),
                request.callback_at,
                now,
            )
            .await?;

        let session = match &record.agent_id {
            Some(agent_id) => self.release_agent_after_disposition(agent_id, &record, &disposition).await,
            None => None,
        };

        info!(
            "📝 Call {} dispositioned {} (lead {} -> {})",
            record.id, disposition.code, record.lead_id, lead_status
        );

        Ok(DispositionResult {
            call_id: record.id,
            lead_status,
            callback_at,
            session,
        })
    }

    /// Write a disposition and apply its effect on the lead. Shared by agent
    /// submissions and the reaper's automatic wrap-up.
    pub(crate) async fn record_disposition(
        &self,
        record: &CallRecord,
        disposition: &Disposition,
        notes: Option<&str>,
        callback_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(LeadStatus, Option<DateTime<Utc>>)> {
        if !self
            .db
            .set_call_disposition(record.id, &disposition.code, notes)
            .await?
        {
            return Err(DialerError::already_exists(format!(
                "call {} already has a disposition",
                record.id
            )));
        }

        let outcome = if disposition.triggers_dnc {
            let reason = format!("disposition {}", disposition.code);
            let marked = self
                .db
                .add_dnc_number(&record.phone_number, Some(&reason), now)
                .await?;
            // Same number may be queued under other leads and campaigns
            self.hopper.remove_lead(record.lead_id);
            for lead_id in marked {
                self.hopper.remove_lead(lead_id);
            }
            (LeadStatus::Dnc, None)
        } else if disposition.triggers_callback {
            let at = callback_at
                .unwrap_or_else(|| now + Duration::seconds(disposition.callback_delay_secs as i64));
            self.db
                .update_lead_status(record.lead_id, LeadStatus::Callback, Some(at))
                .await?;
            (LeadStatus::Callback, Some(at))
        } else {
            self.db
                .update_lead_status(record.lead_id, disposition.lead_status, None)
                .await?;
            (disposition.lead_status, None)
        };

        if disposition.is_sale {
            self.stats.record_sale(record.campaign_id);
        }
        Ok(outcome)
    }

    /// Finish the agent's work on the call: end it if still talking, leave
    /// wrap-up, and close the session if a logout is pending.
    async fn release_agent_after_disposition(
        &self,
        agent_id: &AgentId,
        record: &CallRecord,
        disposition: &Disposition,
    ) -> Option<AgentSession> {
        let session = self.sessions.get(agent_id)?;
        let now = Utc::now();

        let on_this_call = session.current_call.as_ref().map(|c| c.call_id) == Some(record.id);
        let wrapping_this_call = session.state == SessionState::Wrapup
            && session.last_call.as_ref().map(|c| c.call_id) == Some(record.id);

        let updated = if session.state == SessionState::OnCall && on_this_call {
            let updated = self.sessions.complete_call_work(
                agent_id,
                Some(record.id),
                disposition.auto_available,
                now,
            )?;
            // The hangup event finalizes the call record
            if let Some(gateway) = self.gateways.get(&session.server_id) {
                self.hangup_customer(&gateway, &record.channel_id).await;
            }
            updated
        } else if wrapping_this_call {
            self.sessions
                .complete_call_work(agent_id, None, disposition.auto_available, now)?
        } else {
            return None;
        };

        if updated.logout_requested {
            return self
                .teardown_session(agent_id, SessionState::Offline, "logout")
                .await;
        }
        if !updated.available {
            warn!("⏸️ Agent {} paused after disposition {}", agent_id, disposition.code);
        }
        self.session_changed(&updated, None).await;
        Some(updated)
    }
}
