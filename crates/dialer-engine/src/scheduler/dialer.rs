use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::pacing::compute_dial_target;
use crate::database::call_records::CallFinalization;
use crate::database::campaigns::{Campaign, DialMethod};
use crate::database::leads::LeadStatus;
use crate::engine::DialerEngine;
use crate::error::Result;
use crate::gateway::{with_timeout, ChannelMetadata, GatewayError, OriginateRequest, TelephonyGateway};
use crate::hopper::HopperEntry;
use crate::orchestrator::calls::{AttemptState, CallOutcome, DialAttempt};
use crate::types::ChannelId;

impl DialerEngine {
    /// One pass over every active campaign. Returns the number of calls
    /// originated.
    pub async fn run_scheduler_tick(&self) -> Result<usize> {
        let now = Utc::now();
        let campaigns = self.db.list_active_campaigns().await?;

        let mut placed = 0;
        for campaign in campaigns {
            if !campaign.dial_method.is_auto_dial() {
                continue;
            }
            match self.tick_campaign(&campaign, now).await {
                Ok(count) => placed += count,
                Err(e) if e.is_fatal_config() => {
                    self.pause_unhealthy(campaign.id, &e.to_string()).await;
                }
                Err(e) => {
                    error!("Scheduler tick failed for campaign {}: {}", campaign.id, e);
                }
            }
        }
        Ok(placed)
    }

    async fn tick_campaign(&self, campaign: &Campaign, now: DateTime<Utc>) -> Result<usize> {
        let gateway = self.gateways.resolve(campaign.server_id.as_deref())?;
        let server_id = gateway.server_id().to_string();

        let live = self.calls.live_leads(campaign.id);
        let released = self.hopper.expire_stale(
            campaign.id,
            self.config.scheduler.stale_dial_age(),
            now,
            |lead| live.contains(&lead),
        );
        if !released.is_empty() {
            warn!(
                "♻️ Returned {} orphaned hopper entries of campaign {}",
                released.len(),
                campaign.id
            );
        }

        self.refill_hopper(campaign, now).await?;

        let available = self.sessions.count_available(campaign.id, &server_id, now);
        let active = self.calls.in_flight(campaign.id);
        let ratio = match campaign.dial_method {
            DialMethod::Predictive => campaign.dial_ratio,
            _ => 1.0,
        };
        let target = compute_dial_target(
            available,
            active,
            ratio,
            campaign.max_concurrent_calls,
            campaign.max_lines,
        );

        if campaign.dial_method == DialMethod::Predictive {
            self.tune_dial_ratio(campaign, now).await;
        }

        if target == 0 {
            return Ok(0);
        }

        let entries = self.hopper.pop_candidates(campaign.id, target, now);
        debug!(
            "Campaign {}: {} agent(s), {} active, ratio {:.2} -> dialing {} of {}",
            campaign.id,
            available,
            active,
            ratio,
            entries.len(),
            target
        );

        let mut placed = 0;
        for entry in entries {
            if self.dial_lead(campaign, &gateway, entry, now).await {
                placed += 1;
            }
        }
        Ok(placed)
    }

    /// Move the stored ratio one step toward what the abandon rate allows
    async fn tune_dial_ratio(&self, campaign: &Campaign, now: DateTime<Utc>) {
        let rate = self.stats.abandon_rate(campaign.id, now);
        let next = self.config.scheduler.ratio_policy.adjust(
            campaign.dial_ratio,
            campaign.dial_ratio_min,
            campaign.dial_ratio_max,
            rate,
            campaign.abandon_threshold,
        );

        if (next - campaign.dial_ratio).abs() < 1e-9 {
            return;
        }
        match self.db.update_dial_ratio(campaign.id, next).await {
            Ok(()) => info!(
                "🎚️ Campaign {} dial ratio {:.2} -> {:.2} (abandon rate {:.1}%)",
                campaign.id,
                campaign.dial_ratio,
                next,
                rate.unwrap_or_default()
            ),
            Err(e) => warn!("Failed to store dial ratio of campaign {}: {}", campaign.id, e),
        }
    }

    /// Originate one popped lead. Returns whether a call was placed.
    async fn dial_lead(
        &self,
        campaign: &Campaign,
        gateway: &Arc<dyn TelephonyGateway>,
        entry: HopperEntry,
        now: DateTime<Utc>,
    ) -> bool {
        // The hopper may be minutes old; check the lead as it is now
        let lead = match self.db.get_lead(entry.lead_id).await {
            Ok(Some(lead)) => lead,
            Ok(None) => {
                warn!("Lead {} vanished from the store, dropping it", entry.lead_id);
                self.hopper.complete(campaign.id, entry.lead_id);
                return false;
            }
            Err(e) => {
                warn!("Cannot load lead {}: {}", entry.lead_id, e);
                self.hopper.release(campaign.id, entry.lead_id);
                return false;
            }
        };

        let within_attempts =
            lead.status == LeadStatus::Callback || lead.call_count < campaign.max_attempts;
        if !lead.is_dialable(now) || !within_attempts {
            debug!("Lead {} no longer dialable ({})", lead.id, lead.status);
            self.hopper.complete(campaign.id, lead.id);
            return false;
        }
        match self.db.is_dnc_number(&lead.phone_number).await {
            Ok(false) => {}
            Ok(true) => {
                info!("🚫 Lead {} is on the do-not-call list, skipping", lead.id);
                self.hopper.complete(campaign.id, lead.id);
                return false;
            }
            Err(e) => {
                warn!("DNC lookup failed for lead {}: {}", lead.id, e);
                self.hopper.release(campaign.id, lead.id);
                return false;
            }
        }

        let channel_id = ChannelId::generate(&self.config.general.node_name);
        let attempt = DialAttempt::new(
            campaign.id,
            lead.id,
            &lead.phone_number,
            gateway.server_id(),
            channel_id.clone(),
            now,
        );

        // Tracked before originate: the first events can beat the reply
        self.calls.register(attempt.clone());
        if let Err(e) = self.db.insert_call_record(&attempt).await {
            error!("Cannot record attempt for lead {}: {}", lead.id, e);
            self.calls.remove(&channel_id);
            self.hopper.release(campaign.id, lead.id);
            return false;
        }
        if let Err(e) = self.db.record_dial_attempt(lead.id, now).await {
            warn!("Failed to count dial attempt of lead {}: {}", lead.id, e);
        }

        let metadata =
            ChannelMetadata::customer(attempt.call_id, campaign.id, lead.id, &lead.phone_number);
        let request = OriginateRequest {
            channel_id: channel_id.clone(),
            endpoint: campaign.dial_string(&lead.phone_number),
            caller_id: campaign.caller_id.clone(),
            variables: metadata.to_variables(),
            timeout: Duration::from_secs(campaign.call_timeout_secs),
        };

        match with_timeout(
            self.config.matcher.command_timeout(),
            "originate",
            gateway.originate(request),
        )
        .await
        {
            Ok(_) => {
                self.stats.record_placed(campaign.id);
                debug!("📞 Dialing lead {} on {}", lead.id, channel_id);
                true
            }
            Err(e) => {
                warn!("❌ Originate failed for lead {}: {}", lead.id, e);
                self.fail_origination(&attempt, &e).await;
                false
            }
        }
    }

    /// Compensate a failed originate: the attempt fails, the lead goes back
    /// to the hopper
    async fn fail_origination(&self, attempt: &DialAttempt, cause: &GatewayError) {
        let now = Utc::now();
        let failed = self.calls.advance(
            &attempt.channel_id,
            &[AttemptState::Initiated, AttemptState::Ringing],
            AttemptState::Failed,
            now,
            |_| {},
        );
        if failed.is_none() {
            // Events already settled this attempt
            return;
        }

        let finalization = CallFinalization {
            state: AttemptState::Failed,
            outcome: CallOutcome::Failed,
            ended_at: now,
            hangup_cause: Some(cause.to_string()),
        };
        if let Err(e) = self.db.finalize_call(attempt.call_id, &finalization).await {
            warn!("Failed to finalize call {}: {}", attempt.call_id, e);
        }
        if let Err(e) = self
            .db
            .update_lead_status(attempt.lead_id, LeadStatus::Failed, None)
            .await
        {
            warn!("Failed to update lead {}: {}", attempt.lead_id, e);
        }
        self.stats.record_failed(attempt.campaign_id);
        self.hopper.release(attempt.campaign_id, attempt.lead_id);
    }
}
