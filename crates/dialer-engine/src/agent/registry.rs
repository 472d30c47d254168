//! In-memory registry of agent sessions.
//!
//! Every state change goes through a single `DashMap::get_mut` guard on the
//! agent's entry, so each transition is a compare-and-swap on the session's
//! current state. Two matchers racing for the same agent serialize on that
//! guard; the second one sees the session already `on_call` and is refused.
//! No guard is ever held across an `.await`.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::session::{AgentSession, CallRef, Ineligible, SessionState};
use crate::error::{DialerError, Result};
use crate::types::{AgentId, CallId, CampaignId, ChannelId};

/// Result of trying to claim a ready agent for a call
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(AgentSession),
    Rejected(Ineligible),
    /// No session for this agent any more
    Gone,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<AgentId, AgentSession>,
    agent_channels: DashMap<ChannelId, AgentId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session. Fails if the agent already has a live one.
    pub fn open(&self, session: AgentSession) -> Result<()> {
        match self.sessions.entry(session.agent_id.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_live() {
                    return Err(DialerError::already_exists(format!(
                        "agent {} already has a {} session",
                        session.agent_id,
                        existing.get().state
                    )));
                }
                if let Some(channel) = &existing.get().agent_channel {
                    self.agent_channels.remove(channel);
                }
                existing.insert(session);
            }
            Entry::Vacant(slot) => {
                slot.insert(session);
            }
        }
        Ok(())
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<AgentSession> {
        self.sessions.get(agent_id).map(|s| s.clone())
    }

    pub fn all(&self) -> Vec<AgentSession> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn live_sessions(&self) -> Vec<AgentSession> {
        self.sessions
            .iter()
            .filter(|s| s.is_live())
            .map(|s| s.value().clone())
            .collect()
    }

    /// Agents that could take a call right now in this campaign and server
    pub fn count_available(&self, campaign_id: CampaignId, server_id: &str, now: DateTime<Utc>) -> usize {
        self.sessions
            .iter()
            .filter(|s| {
                s.campaign_id == campaign_id
                    && s.server_id == server_id
                    && s.check_eligible(now).is_ok()
            })
            .count()
    }

    /// Ready sessions of a campaign on one server, longest idle first
    pub fn ready_candidates(&self, campaign_id: CampaignId, server_id: &str) -> Vec<AgentSession> {
        let mut candidates: Vec<AgentSession> = self
            .sessions
            .iter()
            .filter(|s| {
                s.campaign_id == campaign_id
                    && s.server_id == server_id
                    && s.state == SessionState::Ready
            })
            .map(|s| s.value().clone())
            .collect();
        candidates.sort_by_key(|s| s.idle_order_key());
        candidates
    }

    /// Atomically check a candidate and move it `ready → on_call`
    pub fn try_claim(&self, agent_id: &AgentId, call: CallRef, now: DateTime<Utc>) -> ClaimOutcome {
        let Some(mut session) = self.sessions.get_mut(agent_id) else {
            return ClaimOutcome::Gone;
        };

        if let Err(reason) = session.check_eligible(now) {
            return ClaimOutcome::Rejected(reason);
        }

        session.enter(SessionState::OnCall, now);
        session.current_call = Some(call);
        session.last_call_start = Some(now);
        ClaimOutcome::Claimed(session.clone())
    }

    /// Undo a claim whose bridge could not be built: `on_call → ready`, only
    /// if the session is still on that call.
    pub fn release_claim(
        &self,
        agent_id: &AgentId,
        call_id: CallId,
        now: DateTime<Utc>,
    ) -> Option<AgentSession> {
        let mut session = self.sessions.get_mut(agent_id)?;
        if session.state != SessionState::OnCall || !is_current_call(&session, call_id) {
            return None;
        }
        session.enter(SessionState::Ready, now);
        session.current_call = None;
        Some(session.clone())
    }

    /// The customer call ended. Goes to wrap-up when `wrapup` is given,
    /// straight to ready otherwise. No-op unless the session is on that call.
    pub fn finish_call(
        &self,
        agent_id: &AgentId,
        call_id: CallId,
        wrapup: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Option<AgentSession> {
        let mut session = self.sessions.get_mut(agent_id)?;
        if session.state != SessionState::OnCall || !is_current_call(&session, call_id) {
            return None;
        }

        session.last_call = session.current_call.take();
        session.last_call_end = Some(now);
        match wrapup {
            Some(timeout) => {
                session.enter(SessionState::Wrapup, now);
                session.wrapup_until = Some(now + timeout);
            }
            None => {
                session.enter(SessionState::Ready, now);
                session.wrapup_until = None;
            }
        }
        Some(session.clone())
    }

    /// Leave wrap-up (or an undisposed call) for ready, setting the
    /// availability flag. Accepts `on_call` only for the given call, which
    /// is how a disposition submitted during the call ends it.
    pub fn complete_call_work(
        &self,
        agent_id: &AgentId,
        call_id: Option<CallId>,
        available: bool,
        now: DateTime<Utc>,
    ) -> Option<AgentSession> {
        let mut session = self.sessions.get_mut(agent_id)?;
        match session.state {
            SessionState::Wrapup => {}
            SessionState::OnCall if call_id.map_or(false, |id| is_current_call(&session, id)) => {
                session.last_call = session.current_call.take();
                session.last_call_end = Some(now);
            }
            _ => return None,
        }

        session.enter(SessionState::Ready, now);
        session.wrapup_until = None;
        session.available = available;
        Some(session.clone())
    }

    /// `connecting → ready` once the agent leg is up inside the bridge
    pub fn mark_ready(
        &self,
        agent_id: &AgentId,
        agent_channel: &ChannelId,
        now: DateTime<Utc>,
    ) -> Option<AgentSession> {
        let mut session = self.sessions.get_mut(agent_id)?;
        if session.state != SessionState::Connecting
            || session.agent_channel.as_ref() != Some(agent_channel)
            || session.bridge_id.is_none()
        {
            return None;
        }
        session.enter(SessionState::Ready, now);
        Some(session.clone())
    }

    /// Close a live session. The returned snapshot still carries the current
    /// call, channel and bridge so the caller can tear them down.
    pub fn close(
        &self,
        agent_id: &AgentId,
        state: SessionState,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<AgentSession> {
        debug_assert!(state.is_terminal());
        let mut session = self.sessions.get_mut(agent_id)?;
        if !session.state.can_transition_to(state) {
            return None;
        }
        session.enter(state, now);
        session.end_reason = Some(reason.to_string());
        let snapshot = session.clone();
        drop(session);

        if let Some(channel) = &snapshot.agent_channel {
            self.agent_channels.remove(channel);
        }
        debug!("Session of {} closed as {} ({})", agent_id, state, reason);
        Some(snapshot)
    }

    /// Mutate non-state fields of a live session
    pub fn update<F>(&self, agent_id: &AgentId, f: F) -> Option<AgentSession>
    where
        F: FnOnce(&mut AgentSession),
    {
        let mut session = self.sessions.get_mut(agent_id)?;
        if !session.is_live() {
            return None;
        }
        f(&mut *session);
        session.version += 1;
        Some(session.clone())
    }

    pub fn bind_agent_channel(&self, channel: ChannelId, agent_id: AgentId) {
        self.agent_channels.insert(channel, agent_id);
    }

    pub fn agent_for_channel(&self, channel: &ChannelId) -> Option<AgentId> {
        self.agent_channels.get(channel).map(|a| a.clone())
    }

    /// Apply an endpoint registration change, returning the affected agents
    pub fn set_endpoint_registered(
        &self,
        server_id: &str,
        endpoint: &str,
        registered: bool,
    ) -> Vec<AgentId> {
        let mut affected = Vec::new();
        for mut session in self.sessions.iter_mut() {
            if session.is_live() && session.server_id == server_id && session.endpoint == endpoint {
                session.endpoint_registered = registered;
                session.version += 1;
                affected.push(session.agent_id.clone());
            }
        }
        affected
    }

    /// Session whose current call is `call_id`
    pub fn agent_on_call(&self, call_id: CallId) -> Option<AgentId> {
        self.sessions
            .iter()
            .find(|s| is_current_call(s, call_id))
            .map(|s| s.agent_id.clone())
    }

    /// Drop closed sessions that ended before `cutoff`
    pub fn evict_closed(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| s.is_live() || s.ended_at.map_or(true, |ended| ended > cutoff));
        before - self.sessions.len()
    }
}

fn is_current_call(session: &AgentSession, call_id: CallId) -> bool {
    session
        .current_call
        .as_ref()
        .map_or(false, |call| call.call_id == call_id)
}
