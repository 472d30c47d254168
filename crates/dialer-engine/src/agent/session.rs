use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AgentId, BridgeId, CallId, CampaignId, ChannelId, LeadId};

/// Agent session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Agent leg and standing bridge being set up
    Connecting,
    /// Idle with a standing bridge, eligible for matching
    Ready,
    /// Bridged with a customer
    OnCall,
    /// Post-call work before returning to ready
    Wrapup,
    Offline,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::OnCall => "on_call",
            SessionState::Wrapup => "wrapup",
            SessionState::Offline => "offline",
            SessionState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Offline | SessionState::Error)
    }

    /// Allowed session transitions
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            // Closing is always possible from a live session
            (from, Offline | Error) => !from.is_terminal(),

            (Connecting, Ready) => true,
            (Ready, OnCall) => true,
            // Wrap-up, or straight back to ready (auto-available, failed bridge)
            (OnCall, Wrapup) | (OnCall, Ready) => true,
            (Wrapup, Ready) => true,

            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connecting" => Ok(SessionState::Connecting),
            "ready" => Ok(SessionState::Ready),
            "on_call" => Ok(SessionState::OnCall),
            "wrapup" => Ok(SessionState::Wrapup),
            "offline" => Ok(SessionState::Offline),
            "error" => Ok(SessionState::Error),
            other => Err(anyhow!("unknown session state '{}'", other)),
        }
    }
}

/// The customer call a session is handling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRef {
    pub call_id: CallId,
    pub channel_id: ChannelId,
    pub lead_id: LeadId,
}

/// Why a ready session was passed over by the matcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
    NotReady,
    Unavailable,
    EndpointUnregistered,
    InWrapupWindow,
    NoBridge,
    LogoutPending,
}

/// One login of one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: Uuid,
    pub agent_id: AgentId,
    pub campaign_id: CampaignId,
    /// Telephony server holding the agent leg and bridge
    pub server_id: String,
    /// Agent device, e.g. `PJSIP/1001`
    pub endpoint: String,
    pub agent_channel: Option<ChannelId>,
    pub bridge_id: Option<BridgeId>,
    pub state: SessionState,
    pub state_since: DateTime<Utc>,
    /// Agent-controlled pause flag
    pub available: bool,
    pub endpoint_registered: bool,
    pub login_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_call_start: Option<DateTime<Utc>>,
    pub last_call_end: Option<DateTime<Utc>>,
    pub wrapup_until: Option<DateTime<Utc>>,
    pub current_call: Option<CallRef>,
    /// Most recent finished call, the target of a wrap-up disposition
    pub last_call: Option<CallRef>,
    /// Logout requested mid-call; close once the call ends
    pub logout_requested: bool,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    /// Bumped on every change, lets callers detect concurrent updates
    pub version: u64,
}

impl AgentSession {
    pub fn new(
        agent_id: AgentId,
        campaign_id: CampaignId,
        server_id: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            agent_id,
            campaign_id,
            server_id: server_id.to_string(),
            endpoint: endpoint.to_string(),
            agent_channel: None,
            bridge_id: None,
            state: SessionState::Connecting,
            state_since: now,
            available: true,
            endpoint_registered: false,
            login_at: now,
            last_heartbeat: now,
            last_call_start: None,
            last_call_end: None,
            wrapup_until: None,
            current_call: None,
            last_call: None,
            logout_requested: false,
            ended_at: None,
            end_reason: None,
            version: 0,
        }
    }

    /// Checks the matcher applies to a candidate before claiming it
    pub fn check_eligible(&self, now: DateTime<Utc>) -> Result<(), Ineligible> {
        if self.state != SessionState::Ready {
            return Err(Ineligible::NotReady);
        }
        if !self.available {
            return Err(Ineligible::Unavailable);
        }
        if self.logout_requested {
            return Err(Ineligible::LogoutPending);
        }
        if !self.endpoint_registered {
            return Err(Ineligible::EndpointUnregistered);
        }
        if self.wrapup_until.map_or(false, |until| until > now) {
            return Err(Ineligible::InWrapupWindow);
        }
        if self.bridge_id.is_none() {
            return Err(Ineligible::NoBridge);
        }
        Ok(())
    }

    /// Fairness key: longest idle first. Sessions that never had a call sort
    /// before any that did, then earliest login, then agent id.
    pub fn idle_order_key(&self) -> (Option<DateTime<Utc>>, DateTime<Utc>, AgentId) {
        (self.last_call_end, self.login_at, self.agent_id.clone())
    }

    /// Apply a state change, stamping bookkeeping fields. Callers have
    /// already validated the transition.
    pub(crate) fn enter(&mut self, next: SessionState, now: DateTime<Utc>) {
        self.state = next;
        self.state_since = now;
        self.version += 1;
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }
}
