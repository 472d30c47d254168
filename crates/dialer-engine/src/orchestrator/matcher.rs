//! Call-agent matching.
//!
//! On answer the customer is offered to the campaign's ready agents, longest
//! idle first. Claiming an agent is a compare-and-swap on its session
//! (`ready → on_call`), so when two answers race for the same agent exactly
//! one wins; the loser moves on to the next candidate. Only then is the
//! customer added to the agent's bridge. If that fails the claim is undone.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::calls::{AttemptState, CallOutcome, DialAttempt};
use crate::agent::registry::ClaimOutcome;
use crate::agent::session::{AgentSession, CallRef, Ineligible};
use crate::database::call_records::CallFinalization;
use crate::database::leads::LeadStatus;
use crate::engine::DialerEngine;
use crate::gateway::{with_timeout, TelephonyGateway};
use crate::notify::{Audience, DialerNotification};
use crate::types::{AgentId, ChannelId};

impl DialerEngine {
    /// A customer channel answered. Claim an agent and bridge, or abandon.
    pub(crate) async fn handle_customer_answered(&self, channel_id: &ChannelId) {
        let now = Utc::now();
        let Some(attempt) = self.calls.advance(
            channel_id,
            &[AttemptState::Initiated, AttemptState::Ringing],
            AttemptState::Answered,
            now,
            |a| a.answered_at = Some(now),
        ) else {
            debug!("Ignoring answer on {}: not waiting for one", channel_id);
            return;
        };

        if let Err(e) = self.db.mark_call_answered(attempt.call_id, now).await {
            warn!("Failed to record answer of {}: {}", attempt.call_id, e);
        }

        let Some(gateway) = self.gateways.get(&attempt.server_id) else {
            error!("Call {} answered on unknown server {}", attempt.call_id, attempt.server_id);
            self.fail_answered_call(&attempt, None, "unknown telephony server").await;
            return;
        };

        let call = CallRef {
            call_id: attempt.call_id,
            channel_id: channel_id.clone(),
            lead_id: attempt.lead_id,
        };

        match self.claim_agent(&attempt, call, now) {
            Some(session) => self.bridge_call(&attempt, session, &gateway).await,
            None => self.abandon_call(&attempt, &gateway, now).await,
        }
    }

    /// Walk the ready sessions, longest idle first, and claim the first one
    /// that passes. A candidate taken by a concurrent match is excluded and
    /// the search restarts.
    fn claim_agent(&self, attempt: &DialAttempt, call: CallRef, now: DateTime<Utc>) -> Option<AgentSession> {
        let mut excluded: HashSet<AgentId> = HashSet::new();

        loop {
            let candidates = self
                .sessions
                .ready_candidates(attempt.campaign_id, &attempt.server_id);

            let mut lost_race = false;
            for candidate in candidates {
                if excluded.contains(&candidate.agent_id) {
                    continue;
                }
                match self.sessions.try_claim(&candidate.agent_id, call.clone(), now) {
                    ClaimOutcome::Claimed(session) => {
                        debug!("🎯 Claimed agent {} for call {}", session.agent_id, call.call_id);
                        return Some(session);
                    }
                    ClaimOutcome::Rejected(Ineligible::NotReady) | ClaimOutcome::Gone => {
                        // Taken or closed since the snapshot
                        lost_race = true;
                        excluded.insert(candidate.agent_id);
                    }
                    ClaimOutcome::Rejected(reason) => {
                        debug!("Agent {} skipped: {:?}", candidate.agent_id, reason);
                        excluded.insert(candidate.agent_id);
                    }
                }
            }

            if !lost_race {
                return None;
            }
        }
    }

    async fn bridge_call(
        &self,
        attempt: &DialAttempt,
        session: AgentSession,
        gateway: &Arc<dyn TelephonyGateway>,
    ) {
        let now = Utc::now();
        let agent_id = session.agent_id.clone();
        let bridge_id = session.bridge_id.clone();

        let matched = self.calls.advance(
            &attempt.channel_id,
            &[AttemptState::Answered],
            AttemptState::Matched,
            now,
            |a| {
                a.agent_id = Some(agent_id.clone());
                a.bridge_id = bridge_id.clone();
            },
        );
        let (Some(_), Some(bridge)) = (matched, bridge_id) else {
            warn!("Call {} moved on before it could be bridged", attempt.call_id);
            self.sessions.release_claim(&agent_id, attempt.call_id, now);
            return;
        };

        if let Err(e) = self.db.assign_call_agent(attempt.call_id, &agent_id).await {
            warn!("Failed to record agent of call {}: {}", attempt.call_id, e);
        }

        let result = with_timeout(
            self.config.matcher.command_timeout(),
            "add_channel_to_bridge",
            gateway.add_channel_to_bridge(&bridge, &attempt.channel_id),
        )
        .await;

        if let Err(e) = result {
            warn!(
                "❌ Bridging call {} to agent {} failed: {}",
                attempt.call_id, agent_id, e
            );
            if let Some(session) = self.sessions.release_claim(&agent_id, attempt.call_id, Utc::now()) {
                self.session_changed(&session, Some("bridge failed".to_string())).await;
            }
            self.hangup_customer(gateway, &attempt.channel_id).await;
            self.settle_failed_attempt(
                attempt,
                &[AttemptState::Matched],
                LeadStatus::Failed,
                &format!("bridge failed: {}", e),
            )
            .await;
            // Back in line right away; the agent never talked to this lead
            self.hopper.release(attempt.campaign_id, attempt.lead_id);
            return;
        }

        let now = Utc::now();
        if self
            .calls
            .advance(
                &attempt.channel_id,
                &[AttemptState::Matched],
                AttemptState::Bridged,
                now,
                |_| {},
            )
            .is_none()
        {
            // Settled elsewhere while the command was in flight
            warn!("Call {} left matched state while bridging", attempt.call_id);
            return;
        }
        if let Err(e) = self.db.mark_call_bridged(attempt.call_id, now).await {
            warn!("Failed to record bridge of call {}: {}", attempt.call_id, e);
        }

        self.stats.record_answer(attempt.campaign_id, false, now);
        self.hopper.complete(attempt.campaign_id, attempt.lead_id);

        info!(
            "🔗 Call {} ({}) bridged to agent {}",
            attempt.call_id, attempt.phone_number, agent_id
        );
        self.notifier.publish(
            Audience::Agent(agent_id.clone()),
            DialerNotification::CallConnected {
                call_id: attempt.call_id,
                lead_id: attempt.lead_id,
                phone_number: attempt.phone_number.clone(),
            },
        );
        self.session_changed(&session, None).await;
    }

    /// Nobody to take the call: drop the customer and count the abandon
    async fn abandon_call(
        &self,
        attempt: &DialAttempt,
        gateway: &Arc<dyn TelephonyGateway>,
        now: DateTime<Utc>,
    ) {
        if self
            .calls
            .advance(
                &attempt.channel_id,
                &[AttemptState::Answered],
                AttemptState::Abandoned,
                now,
                |_| {},
            )
            .is_none()
        {
            return;
        }

        warn!(
            "📵 No ready agent for call {} ({}), abandoning",
            attempt.call_id, attempt.phone_number
        );
        self.hangup_customer(gateway, &attempt.channel_id).await;

        let finalization = CallFinalization {
            state: AttemptState::Abandoned,
            outcome: CallOutcome::Answered,
            ended_at: now,
            hangup_cause: Some("no_agent".to_string()),
        };
        if let Err(e) = self.db.finalize_call(attempt.call_id, &finalization).await {
            warn!("Failed to finalize call {}: {}", attempt.call_id, e);
        }
        self.set_lead_status(attempt.lead_id, LeadStatus::Dropped).await;

        self.stats.record_answer(attempt.campaign_id, true, now);
        self.hopper.complete(attempt.campaign_id, attempt.lead_id);
        self.notifier.publish(
            Audience::Campaign(attempt.campaign_id),
            DialerNotification::CallAbandoned {
                call_id: attempt.call_id,
                lead_id: attempt.lead_id,
                phone_number: attempt.phone_number.clone(),
            },
        );
    }

    /// Answered call that cannot be matched for data reasons
    async fn fail_answered_call(
        &self,
        attempt: &DialAttempt,
        gateway: Option<&Arc<dyn TelephonyGateway>>,
        reason: &str,
    ) {
        if let Some(gateway) = gateway {
            self.hangup_customer(gateway, &attempt.channel_id).await;
        }
        self.settle_failed_attempt(attempt, &[AttemptState::Answered], LeadStatus::Failed, reason)
            .await;
        self.hopper.complete(attempt.campaign_id, attempt.lead_id);
    }

    /// Move an attempt to `failed` and record it. No-op when the attempt
    /// is not in one of `expected`.
    pub(crate) async fn settle_failed_attempt(
        &self,
        attempt: &DialAttempt,
        expected: &[AttemptState],
        lead_status: LeadStatus,
        reason: &str,
    ) -> bool {
        let now = Utc::now();
        if self
            .calls
            .advance(&attempt.channel_id, expected, AttemptState::Failed, now, |_| {})
            .is_none()
        {
            return false;
        }

        let finalization = CallFinalization {
            state: AttemptState::Failed,
            outcome: CallOutcome::Failed,
            ended_at: now,
            hangup_cause: Some(reason.to_string()),
        };
        if let Err(e) = self.db.finalize_call(attempt.call_id, &finalization).await {
            warn!("Failed to finalize call {}: {}", attempt.call_id, e);
        }
        self.set_lead_status(attempt.lead_id, lead_status).await;
        self.stats.record_failed(attempt.campaign_id);
        true
    }

    pub(crate) async fn hangup_customer(&self, gateway: &Arc<dyn TelephonyGateway>, channel_id: &ChannelId) {
        if let Err(e) = with_timeout(
            self.config.matcher.command_timeout(),
            "hangup",
            gateway.hangup(channel_id),
        )
        .await
        {
            debug!("Hangup of {} failed: {}", channel_id, e);
        }
    }

    pub(crate) async fn set_lead_status(&self, lead_id: i64, status: LeadStatus) {
        if let Err(e) = self.db.update_lead_status(lead_id, status, None).await {
            warn!("Failed to set lead {} to {}: {}", lead_id, status, e);
        }
    }
}
