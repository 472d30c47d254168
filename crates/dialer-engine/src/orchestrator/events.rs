//! Gateway event routing.

use chrono::Utc;
use tracing::{debug, info, warn};

use super::calls::{AttemptState, CallOutcome, DialAttempt};
use crate::agent::session::SessionState;
use crate::database::call_records::CallFinalization;
use crate::database::leads::LeadStatus;
use crate::engine::DialerEngine;
use crate::gateway::{ChannelState, EventStream, GatewayEvent, HangupCause};
use crate::notify::{Audience, DialerNotification};
use crate::types::ChannelId;

impl DialerEngine {
    /// Apply one event from the telephony server `server_id`.
    ///
    /// Events for channels the engine does not know (other applications on
    /// the same server, or attempts already purged) are ignored.
    pub async fn handle_gateway_event(&self, server_id: &str, event: GatewayEvent) {
        debug!("📨 {} from {}", event.name(), server_id);

        match event {
            GatewayEvent::ChannelCreated { channel_id, metadata } => {
                debug!("Channel {} created ({:?})", channel_id, metadata.call_type);
            }
            GatewayEvent::ChannelStateChanged { channel_id, state } => match state {
                ChannelState::Ringing => self.handle_customer_ringing(&channel_id),
                ChannelState::Up => {
                    if self.calls.get(&channel_id).is_some() {
                        self.handle_customer_answered(&channel_id).await;
                    } else if let Some(agent_id) = self.sessions.agent_for_channel(&channel_id) {
                        self.handle_agent_leg_up(&agent_id, &channel_id).await;
                    }
                }
                _ => {}
            },
            GatewayEvent::ChannelDestroyed { channel_id, cause } => {
                if self.calls.get(&channel_id).is_some() {
                    self.handle_customer_hangup(&channel_id, cause).await;
                } else if let Some(agent_id) = self.sessions.agent_for_channel(&channel_id) {
                    self.handle_agent_leg_destroyed(&agent_id, &channel_id).await;
                }
            }
            GatewayEvent::MachineDetected { channel_id } => {
                self.handle_machine_detected(&channel_id).await;
            }
            GatewayEvent::EndpointStateChanged { endpoint, state } => {
                self.endpoint_state_changed(server_id, &endpoint, state);
            }
        }
    }

    /// Drain whatever is queued on `events` without waiting. Returns the
    /// number of events handled.
    pub async fn pump_events(&self, server_id: &str, events: &mut EventStream) -> usize {
        let mut handled = 0;
        while let Ok(event) = events.try_recv() {
            self.handle_gateway_event(server_id, event).await;
            handled += 1;
        }
        handled
    }

    fn handle_customer_ringing(&self, channel_id: &ChannelId) {
        if self
            .calls
            .advance(
                channel_id,
                &[AttemptState::Initiated],
                AttemptState::Ringing,
                Utc::now(),
                |_| {},
            )
            .is_some()
        {
            debug!("🔔 {} ringing", channel_id);
        }
    }

    async fn handle_customer_hangup(&self, channel_id: &ChannelId, cause: HangupCause) {
        let Some(attempt) = self.calls.get(channel_id) else {
            return;
        };

        match attempt.state {
            AttemptState::Initiated | AttemptState::Ringing => {
                self.finish_unanswered(&attempt, cause).await;
            }
            AttemptState::Answered | AttemptState::Matched => {
                // Hung up while we were finding or bridging an agent
                if let Some(agent_id) = &attempt.agent_id {
                    if let Some(session) = self
                        .sessions
                        .release_claim(agent_id, attempt.call_id, Utc::now())
                    {
                        self.session_changed(&session, Some("customer hung up".to_string()))
                            .await;
                    }
                }
                if self
                    .settle_failed_attempt(
                        &attempt,
                        &[AttemptState::Answered, AttemptState::Matched],
                        LeadStatus::Dropped,
                        &cause.label(),
                    )
                    .await
                {
                    self.hopper.complete(attempt.campaign_id, attempt.lead_id);
                }
            }
            AttemptState::Bridged => self.finish_bridged(&attempt, cause).await,
            AttemptState::Completed | AttemptState::Failed | AttemptState::Abandoned => {
                // Our own hangup coming back; nothing left to do
                self.calls.remove(channel_id);
            }
        }
    }

    /// Busy, no answer or a network failure before pickup
    async fn finish_unanswered(&self, attempt: &DialAttempt, cause: HangupCause) {
        let (state, outcome, lead_status) = match cause {
            HangupCause::Busy => (AttemptState::Completed, CallOutcome::Busy, LeadStatus::Busy),
            HangupCause::NoAnswer | HangupCause::Normal => {
                (AttemptState::Completed, CallOutcome::NoAnswer, LeadStatus::NoAnswer)
            }
            HangupCause::Failed | HangupCause::Other(_) => {
                (AttemptState::Failed, CallOutcome::Failed, LeadStatus::Failed)
            }
        };

        let now = Utc::now();
        if self
            .calls
            .advance(
                &attempt.channel_id,
                &[AttemptState::Initiated, AttemptState::Ringing],
                state,
                now,
                |_| {},
            )
            .is_none()
        {
            return;
        }

        let finalization = CallFinalization {
            state,
            outcome,
            ended_at: now,
            hangup_cause: Some(cause.label()),
        };
        if let Err(e) = self.db.finalize_call(attempt.call_id, &finalization).await {
            warn!("Failed to finalize call {}: {}", attempt.call_id, e);
        }
        self.set_lead_status(attempt.lead_id, lead_status).await;
        if outcome == CallOutcome::Failed {
            self.stats.record_failed(attempt.campaign_id);
        }
        self.hopper.complete(attempt.campaign_id, attempt.lead_id);
        debug!("Call {} ended unanswered: {}", attempt.call_id, outcome.as_str());
    }

    /// A talking call ended. The agent goes to wrap-up, or straight back to
    /// ready when the campaign has no wrap-up time.
    async fn finish_bridged(&self, attempt: &DialAttempt, cause: HangupCause) {
        let now = Utc::now();
        if self
            .calls
            .advance(
                &attempt.channel_id,
                &[AttemptState::Bridged],
                AttemptState::Completed,
                now,
                |_| {},
            )
            .is_none()
        {
            return;
        }

        let finalization = CallFinalization {
            state: AttemptState::Completed,
            outcome: CallOutcome::Answered,
            ended_at: now,
            hangup_cause: Some(cause.label()),
        };
        if let Err(e) = self.db.finalize_call(attempt.call_id, &finalization).await {
            warn!("Failed to finalize call {}: {}", attempt.call_id, e);
        }

        let Some(agent_id) = attempt.agent_id.clone() else {
            return;
        };
        info!("📴 Call {} with agent {} ended ({})", attempt.call_id, agent_id, cause.label());
        self.notifier.publish(
            Audience::Agent(agent_id.clone()),
            DialerNotification::CallEnded {
                call_id: attempt.call_id,
                lead_id: attempt.lead_id,
            },
        );

        let wrapup = match self.db.get_campaign(attempt.campaign_id).await {
            Ok(Some(campaign)) if !campaign.auto_available && campaign.wrapup_timeout_secs > 0 => {
                Some(campaign.wrapup_timeout())
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Cannot load campaign {}: {}", attempt.campaign_id, e);
                Some(chrono::Duration::seconds(self.config.reaper.stuck_session_secs as i64))
            }
        };

        let Some(session) = self
            .sessions
            .finish_call(&agent_id, attempt.call_id, wrapup, Utc::now())
        else {
            // Already dispositioned, or the session is gone
            return;
        };

        if session.logout_requested {
            self.teardown_session(&agent_id, SessionState::Offline, "logout")
                .await;
        } else {
            self.session_changed(&session, None).await;
        }
    }

    /// Settle a matched or bridged call whose agent session is gone. Its
    /// hangup event may never arrive, so the attempt is finalized here and
    /// stops counting against the campaign's line limits.
    pub(crate) async fn settle_orphaned_call(&self, attempt: &DialAttempt, reason: &str) -> bool {
        match attempt.state {
            AttemptState::Matched => {
                let settled = self
                    .settle_failed_attempt(attempt, &[AttemptState::Matched], LeadStatus::Dropped, reason)
                    .await;
                if settled {
                    self.hopper.complete(attempt.campaign_id, attempt.lead_id);
                }
                settled
            }
            AttemptState::Bridged => {
                let now = Utc::now();
                if self
                    .calls
                    .advance(
                        &attempt.channel_id,
                        &[AttemptState::Bridged],
                        AttemptState::Completed,
                        now,
                        |_| {},
                    )
                    .is_none()
                {
                    return false;
                }

                let finalization = CallFinalization {
                    state: AttemptState::Completed,
                    outcome: CallOutcome::Answered,
                    ended_at: now,
                    hangup_cause: Some(reason.to_string()),
                };
                if let Err(e) = self.db.finalize_call(attempt.call_id, &finalization).await {
                    warn!("Failed to finalize call {}: {}", attempt.call_id, e);
                }
                if let Some(agent_id) = &attempt.agent_id {
                    self.notifier.publish(
                        Audience::Agent(agent_id.clone()),
                        DialerNotification::CallEnded {
                            call_id: attempt.call_id,
                            lead_id: attempt.lead_id,
                        },
                    );
                }
                warn!("🔚 Call {} settled without its hangup event ({})", attempt.call_id, reason);
                true
            }
            _ => false,
        }
    }

    /// Answering machine: hang up without spending an agent
    async fn handle_machine_detected(&self, channel_id: &ChannelId) {
        let now = Utc::now();
        let Some(attempt) = self.calls.advance(
            channel_id,
            &[AttemptState::Initiated, AttemptState::Ringing, AttemptState::Answered],
            AttemptState::Completed,
            now,
            |_| {},
        ) else {
            return;
        };

        info!("🤖 Machine answered call {} ({})", attempt.call_id, attempt.phone_number);
        if let Some(gateway) = self.gateways.get(&attempt.server_id) {
            self.hangup_customer(&gateway, channel_id).await;
        }

        let finalization = CallFinalization {
            state: AttemptState::Completed,
            outcome: CallOutcome::Machine,
            ended_at: now,
            hangup_cause: Some("machine".to_string()),
        };
        if let Err(e) = self.db.finalize_call(attempt.call_id, &finalization).await {
            warn!("Failed to finalize call {}: {}", attempt.call_id, e);
        }
        self.set_lead_status(attempt.lead_id, LeadStatus::Machine).await;
        self.stats.record_machine(attempt.campaign_id);
        self.hopper.complete(attempt.campaign_id, attempt.lead_id);
    }
}
