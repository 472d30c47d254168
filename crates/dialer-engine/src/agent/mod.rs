//! # Agent Sessions
//!
//! An agent works a campaign through one session at a time. Logging in
//! builds a standing mixing bridge on the campaign's telephony server and
//! calls the agent's device into it; the session only becomes `ready` once
//! that leg is up inside the bridge. From then on customers are dropped into
//! the bridge as they answer, and the agent's own leg stays up between calls.
//!
//! ```text
//! connecting ──▶ ready ──▶ on_call ──▶ wrapup ──▶ ready
//!      │           ▲          │                    │
//!      │           └──────────┘ (auto-available)   │
//!      └───────────────▶ offline / error ◀─────────┘
//! ```
//!
//! Every transition is a compare-and-swap in the [`registry::SessionRegistry`].
//! Logging out during a call only flags the session; it is torn down when
//! the call ends.

pub mod registry;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub use registry::{ClaimOutcome, SessionRegistry};
pub use session::{AgentSession, CallRef, Ineligible, SessionState};

use crate::engine::DialerEngine;
use crate::error::{DialerError, Result};
use crate::gateway::{with_timeout, ChannelMetadata, EndpointState, OriginateRequest, TelephonyGateway};
use crate::notify::{Audience, DialerNotification};
use crate::types::{AgentId, CampaignId, ChannelId};

/// Campaign login
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub agent_id: AgentId,
    pub campaign_id: CampaignId,
    /// Agent device, e.g. `PJSIP/1001`
    pub endpoint: String,
    /// Telephony server; the campaign's when unset
    #[serde(default)]
    pub server_id: Option<String>,
}

impl DialerEngine {
    /// Open a session and start calling the agent's device into a fresh
    /// bridge. Returns the session in `connecting`.
    pub async fn login(&self, request: LoginRequest) -> Result<AgentSession> {
        let now = Utc::now();
        let campaign = self
            .db
            .get_campaign(request.campaign_id)
            .await?
            .ok_or_else(|| DialerError::not_found(format!("campaign {}", request.campaign_id)))?;

        let server = request.server_id.as_deref().or(campaign.server_id.as_deref());
        let gateway = self.gateways.resolve(server)?;

        let mut session = AgentSession::new(
            request.agent_id.clone(),
            campaign.id,
            gateway.server_id(),
            &request.endpoint,
            now,
        );
        let agent_channel = ChannelId::generate(&format!("{}-agent", self.config.general.node_name));
        session.agent_channel = Some(agent_channel.clone());

        self.sessions.open(session.clone())?;
        self.sessions
            .bind_agent_channel(agent_channel, request.agent_id.clone());
        if let Err(e) = self.db.record_session_opened(&session).await {
            warn!("Failed to record session of {}: {}", request.agent_id, e);
        }

        info!(
            "🔑 Agent {} logging into campaign {} on {} via {}",
            request.agent_id,
            campaign.id,
            gateway.server_id(),
            request.endpoint
        );

        if let Err(e) = self.connect_agent_leg(&session, &gateway).await {
            error!("❌ Agent {} login failed: {}", request.agent_id, e);
            self.teardown_session(
                &request.agent_id,
                SessionState::Error,
                &format!("agent leg setup failed: {}", e),
            )
            .await;
            return Err(e);
        }

        Ok(self.sessions.get(&request.agent_id).unwrap_or(session))
    }

    async fn connect_agent_leg(
        &self,
        session: &AgentSession,
        gateway: &Arc<dyn TelephonyGateway>,
    ) -> Result<()> {
        let limit = self.config.matcher.command_timeout();
        let agent_id = &session.agent_id;

        let endpoint = with_timeout(limit, "endpoint_status", gateway.endpoint_status(&session.endpoint)).await?;
        let bridge = with_timeout(limit, "create_bridge", gateway.create_bridge()).await?;

        // The bridge must be on the session before the leg can come up
        let bridge_for_session = bridge.clone();
        if self
            .sessions
            .update(agent_id, |s| {
                s.endpoint_registered = endpoint.is_registered();
                s.bridge_id = Some(bridge_for_session);
            })
            .is_none()
        {
            // Closed while we were waiting on the server
            let _ = with_timeout(limit, "destroy_bridge", gateway.destroy_bridge(&bridge)).await;
            return Err(DialerError::agent(format!("session of {} closed during login", agent_id)));
        }

        let channel_id = session
            .agent_channel
            .clone()
            .ok_or_else(|| DialerError::internal("session has no agent channel"))?;
        let request = OriginateRequest {
            channel_id,
            endpoint: session.endpoint.clone(),
            caller_id: None,
            variables: ChannelMetadata::agent_leg(agent_id, session.campaign_id).to_variables(),
            timeout: Duration::from_secs(self.config.reaper.connecting_timeout_secs),
        };
        with_timeout(limit, "originate", gateway.originate(request)).await?;
        Ok(())
    }

    /// The agent leg answered: put it in the bridge and go ready
    pub(crate) async fn handle_agent_leg_up(&self, agent_id: &AgentId, channel_id: &ChannelId) {
        let Some(session) = self.sessions.get(agent_id) else {
            return;
        };
        if session.state != SessionState::Connecting {
            debug!("Agent leg of {} already handled ({})", agent_id, session.state);
            return;
        }
        let (Some(bridge), Some(gateway)) = (session.bridge_id.clone(), self.gateways.get(&session.server_id)) else {
            warn!("Agent {} has no bridge or server, cannot complete login", agent_id);
            self.teardown_session(agent_id, SessionState::Error, "no standing bridge").await;
            return;
        };

        match with_timeout(
            self.config.matcher.command_timeout(),
            "add_channel_to_bridge",
            gateway.add_channel_to_bridge(&bridge, channel_id),
        )
        .await
        {
            Ok(()) => {
                if let Some(ready) = self.sessions.mark_ready(agent_id, channel_id, Utc::now()) {
                    info!("✅ Agent {} ready in bridge {}", agent_id, bridge);
                    self.session_changed(&ready, None).await;
                }
            }
            Err(e) => {
                error!("❌ Cannot bridge agent leg of {}: {}", agent_id, e);
                self.teardown_session(
                    agent_id,
                    SessionState::Error,
                    &format!("agent leg not bridged: {}", e),
                )
                .await;
            }
        }
    }

    /// The agent's device hung up or the leg was lost
    pub(crate) async fn handle_agent_leg_destroyed(&self, agent_id: &AgentId, channel_id: &ChannelId) {
        let Some(session) = self.sessions.get(agent_id) else {
            return;
        };
        if !session.is_live() || session.agent_channel.as_ref() != Some(channel_id) {
            return;
        }
        warn!("📴 Agent leg of {} went away while {}", agent_id, session.state);
        self.teardown_session(agent_id, SessionState::Error, "agent leg hung up")
            .await;
    }

    /// Log out. A session on a call is flagged and closed once the call ends.
    pub async fn logout(&self, agent_id: &AgentId) -> Result<AgentSession> {
        let session = self.live_session(agent_id)?;

        if session.state == SessionState::OnCall {
            let flagged = self
                .sessions
                .update(agent_id, |s| s.logout_requested = true)
                .ok_or_else(|| DialerError::not_found(format!("no live session for {}", agent_id)))?;
            info!("🚪 Agent {} will be logged out after the current call", agent_id);
            return Ok(flagged);
        }

        self.teardown_session(agent_id, SessionState::Offline, "logout")
            .await
            .ok_or_else(|| DialerError::not_found(format!("no live session for {}", agent_id)))
    }

    /// Force-close whatever state the session is in
    pub async fn reset_session(&self, agent_id: &AgentId) -> Result<AgentSession> {
        self.live_session(agent_id)?;
        self.teardown_session(agent_id, SessionState::Offline, "reset")
            .await
            .ok_or_else(|| DialerError::not_found(format!("no live session for {}", agent_id)))
    }

    pub async fn heartbeat(&self, agent_id: &AgentId) -> Result<()> {
        let now = Utc::now();
        self.sessions
            .update(agent_id, |s| s.last_heartbeat = now)
            .map(|_| ())
            .ok_or_else(|| DialerError::not_found(format!("no live session for {}", agent_id)))
    }

    /// Agent-controlled pause flag
    pub async fn set_available(&self, agent_id: &AgentId, available: bool) -> Result<AgentSession> {
        let now = Utc::now();
        let session = self
            .sessions
            .update(agent_id, |s| {
                s.available = available;
                s.last_heartbeat = now;
            })
            .ok_or_else(|| DialerError::not_found(format!("no live session for {}", agent_id)))?;
        info!(
            "{} Agent {} is now {}",
            if available { "🟢" } else { "⏸️" },
            agent_id,
            if available { "available" } else { "paused" }
        );
        self.session_changed(&session, None).await;
        Ok(session)
    }

    pub fn session(&self, agent_id: &AgentId) -> Option<AgentSession> {
        self.sessions.get(agent_id)
    }

    pub(crate) fn endpoint_state_changed(&self, server_id: &str, endpoint: &str, state: EndpointState) {
        let affected = self
            .sessions
            .set_endpoint_registered(server_id, endpoint, state.is_registered());
        if !affected.is_empty() {
            info!("📱 Endpoint {} is {:?} ({} session(s))", endpoint, state, affected.len());
        }
    }

    fn live_session(&self, agent_id: &AgentId) -> Result<AgentSession> {
        self.sessions
            .get(agent_id)
            .filter(|s| s.is_live())
            .ok_or_else(|| DialerError::not_found(format!("no live session for {}", agent_id)))
    }

    /// Close a session and release everything it holds on the telephony
    /// server: the customer call, the agent leg and the bridge. Returns
    /// `None` if the session was already closed.
    pub(crate) async fn teardown_session(
        &self,
        agent_id: &AgentId,
        state: SessionState,
        reason: &str,
    ) -> Option<AgentSession> {
        let closed = self.sessions.close(agent_id, state, reason, Utc::now())?;

        if let Some(gateway) = self.gateways.get(&closed.server_id) {
            let limit = self.config.matcher.command_timeout();
            if let Some(call) = &closed.current_call {
                if let Err(e) = with_timeout(limit, "hangup", gateway.hangup(&call.channel_id)).await {
                    debug!("Customer channel {} already gone: {}", call.channel_id, e);
                }
            }
            if let Some(channel) = &closed.agent_channel {
                if let Err(e) = with_timeout(limit, "hangup", gateway.hangup(channel)).await {
                    debug!("Agent leg {} already gone: {}", channel, e);
                }
            }
            if let Some(bridge) = &closed.bridge_id {
                if let Err(e) = with_timeout(limit, "destroy_bridge", gateway.destroy_bridge(bridge)).await {
                    debug!("Bridge {} already gone: {}", bridge, e);
                }
            }
        }

        // The customer channel may already be gone, in which case no hangup
        // event will ever settle the call
        for attempt in self.calls.assigned_to(agent_id) {
            self.settle_orphaned_call(&attempt, "session closed").await;
        }

        info!("👋 Session of {} closed as {} ({})", agent_id, state, reason);
        self.session_changed(&closed, Some(reason.to_string())).await;
        Some(closed)
    }

    /// Persist and announce a session change
    pub(crate) async fn session_changed(&self, session: &AgentSession, reason: Option<String>) {
        if let Err(e) = self.db.record_session_state(session).await {
            warn!("Failed to persist session of {}: {}", session.agent_id, e);
        }
        let notification = DialerNotification::AgentStatusChanged {
            agent_id: session.agent_id.clone(),
            state: session.state,
            available: session.available,
            reason,
        };
        self.notifier
            .publish(Audience::Agent(session.agent_id.clone()), notification.clone());
        self.notifier
            .publish(Audience::Campaign(session.campaign_id), notification);
    }
}
