//! Dial attempts in flight.
//!
//! [`CallTracker`] is keyed by customer channel id, the key every telephony
//! event carries. Each state change is a compare-and-swap through
//! [`CallTracker::advance`]: the caller names the states it expects to find,
//! so a duplicated or late event finds the attempt elsewhere and does nothing.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::{AgentId, BridgeId, CallId, CampaignId, ChannelId, LeadId};

/// Lifecycle of one outbound customer call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Initiated,
    Ringing,
    Answered,
    /// An agent has been claimed, bridge pending
    Matched,
    Bridged,
    Completed,
    Failed,
    /// Answered with nobody to take it
    Abandoned,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Initiated => "initiated",
            AttemptState::Ringing => "ringing",
            AttemptState::Answered => "answered",
            AttemptState::Matched => "matched",
            AttemptState::Bridged => "bridged",
            AttemptState::Completed => "completed",
            AttemptState::Failed => "failed",
            AttemptState::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Completed | AttemptState::Failed | AttemptState::Abandoned
        )
    }

    pub fn can_transition_to(&self, next: AttemptState) -> bool {
        use AttemptState::*;

        match (self, next) {
            (from, Failed | Abandoned) => !from.is_terminal(),
            (Initiated, Ringing) => true,
            (Initiated | Ringing, Answered) => true,
            (Answered, Matched) => true,
            (Matched, Bridged) => true,
            (Bridged, Completed) => true,
            // No-answer, busy and answering machines complete without an agent
            (Initiated | Ringing | Answered, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(AttemptState::Initiated),
            "ringing" => Ok(AttemptState::Ringing),
            "answered" => Ok(AttemptState::Answered),
            "matched" => Ok(AttemptState::Matched),
            "bridged" => Ok(AttemptState::Bridged),
            "completed" => Ok(AttemptState::Completed),
            "failed" => Ok(AttemptState::Failed),
            "abandoned" => Ok(AttemptState::Abandoned),
            other => Err(anyhow!("unknown attempt state '{}'", other)),
        }
    }
}

/// Terminal outcome recorded on the call record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Answered,
    NoAnswer,
    Busy,
    Machine,
    Failed,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Answered => "answered",
            CallOutcome::NoAnswer => "no_answer",
            CallOutcome::Busy => "busy",
            CallOutcome::Machine => "machine",
            CallOutcome::Failed => "failed",
        }
    }
}

impl FromStr for CallOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "answered" => Ok(CallOutcome::Answered),
            "no_answer" => Ok(CallOutcome::NoAnswer),
            "busy" => Ok(CallOutcome::Busy),
            "machine" => Ok(CallOutcome::Machine),
            "failed" => Ok(CallOutcome::Failed),
            other => Err(anyhow!("unknown call outcome '{}'", other)),
        }
    }
}

/// One originated customer channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialAttempt {
    pub call_id: CallId,
    pub channel_id: ChannelId,
    pub campaign_id: CampaignId,
    pub lead_id: LeadId,
    pub phone_number: String,
    pub server_id: String,
    pub state: AttemptState,
    pub created_at: DateTime<Utc>,
    pub state_since: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub agent_id: Option<AgentId>,
    pub bridge_id: Option<BridgeId>,
}

impl DialAttempt {
    pub fn new(
        campaign_id: CampaignId,
        lead_id: LeadId,
        phone_number: &str,
        server_id: &str,
        channel_id: ChannelId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id: CallId::new(),
            channel_id,
            campaign_id,
            lead_id,
            phone_number: phone_number.to_string(),
            server_id: server_id.to_string(),
            state: AttemptState::Initiated,
            created_at: now,
            state_since: now,
            answered_at: None,
            agent_id: None,
            bridge_id: None,
        }
    }
}

#[derive(Default)]
pub struct CallTracker {
    attempts: DashMap<ChannelId, DialAttempt>,
    by_call: DashMap<CallId, ChannelId>,
}

impl CallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, attempt: DialAttempt) {
        self.by_call
            .insert(attempt.call_id, attempt.channel_id.clone());
        self.attempts.insert(attempt.channel_id.clone(), attempt);
    }

    pub fn get(&self, channel_id: &ChannelId) -> Option<DialAttempt> {
        self.attempts.get(channel_id).map(|a| a.clone())
    }

    pub fn get_by_call(&self, call_id: CallId) -> Option<DialAttempt> {
        let channel_id = self.by_call.get(&call_id).map(|c| c.clone())?;
        self.get(&channel_id)
    }

    /// Move the attempt to `next` if it is currently in one of `expected`.
    /// `update` runs under the same lock. Returns the updated attempt, or
    /// `None` when the attempt is unknown or elsewhere.
    pub fn advance<F>(
        &self,
        channel_id: &ChannelId,
        expected: &[AttemptState],
        next: AttemptState,
        now: DateTime<Utc>,
        update: F,
    ) -> Option<DialAttempt>
    where
        F: FnOnce(&mut DialAttempt),
    {
        let mut attempt = self.attempts.get_mut(channel_id)?;
        if !expected.contains(&attempt.state) || !attempt.state.can_transition_to(next) {
            return None;
        }
        attempt.state = next;
        attempt.state_since = now;
        update(&mut *attempt);
        Some(attempt.clone())
    }

    pub fn remove(&self, channel_id: &ChannelId) -> Option<DialAttempt> {
        let (_, attempt) = self.attempts.remove(channel_id)?;
        self.by_call.remove(&attempt.call_id);
        Some(attempt)
    }

    /// Non-terminal attempts of a campaign
    pub fn in_flight(&self, campaign_id: CampaignId) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.campaign_id == campaign_id && !a.state.is_terminal())
            .count()
    }

    pub fn total_in_flight(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| !a.state.is_terminal())
            .count()
    }

    /// Leads of a campaign with a call still alive
    pub fn live_leads(&self, campaign_id: CampaignId) -> HashSet<LeadId> {
        self.attempts
            .iter()
            .filter(|a| a.campaign_id == campaign_id && !a.state.is_terminal())
            .map(|a| a.lead_id)
            .collect()
    }

    /// Attempts sitting in one of `states` since before `cutoff`
    pub fn stale(&self, states: &[AttemptState], cutoff: DateTime<Utc>) -> Vec<DialAttempt> {
        self.attempts
            .iter()
            .filter(|a| states.contains(&a.state) && a.state_since < cutoff)
            .map(|a| a.clone())
            .collect()
    }

    /// Matched or bridged attempts held by an agent
    pub fn assigned_to(&self, agent_id: &AgentId) -> Vec<DialAttempt> {
        self.attempts
            .iter()
            .filter(|a| {
                matches!(a.state, AttemptState::Matched | AttemptState::Bridged)
                    && a.agent_id.as_ref() == Some(agent_id)
            })
            .map(|a| a.clone())
            .collect()
    }

    /// Drop terminal attempts older than `cutoff`; they only linger to
    /// absorb duplicate events
    pub fn purge_terminal(&self, cutoff: DateTime<Utc>) -> usize {
        let expired: Vec<ChannelId> = self
            .attempts
            .iter()
            .filter(|a| a.state.is_terminal() && a.state_since < cutoff)
            .map(|a| a.key().clone())
            .collect();
        for channel_id in &expired {
            self.remove(channel_id);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

/// Time a terminal attempt stays tracked to swallow duplicate events
pub(crate) fn terminal_linger() -> Duration {
    Duration::seconds(60)
}
