//! Outbound notifications to agents and supervisors.
//!
//! The engine publishes what happened; delivery (websocket push, message bus,
//! log) is up to the [`NotificationSink`]. [`BroadcastNotifier`] fans events
//! out over a tokio broadcast channel and is what the server uses by default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::agent::session::SessionState;
use crate::types::{AgentId, CallId, CampaignId, LeadId};

/// Who a notification is for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Audience {
    Agent(AgentId),
    Campaign(CampaignId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DialerNotification {
    /// A customer was bridged to the agent
    CallConnected {
        call_id: CallId,
        lead_id: LeadId,
        phone_number: String,
    },
    /// The customer side of a bridged call hung up
    CallEnded { call_id: CallId, lead_id: LeadId },
    /// Answered customer with no agent to take the call
    CallAbandoned {
        call_id: CallId,
        lead_id: LeadId,
        phone_number: String,
    },
    AgentStatusChanged {
        agent_id: AgentId,
        state: SessionState,
        available: bool,
        reason: Option<String>,
    },
    /// Campaign paused or resumed by the engine
    CampaignHealthChanged {
        campaign_id: CampaignId,
        healthy: bool,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub audience: Audience,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub notification: DialerNotification,
}

/// Delivery of engine notifications. Publishing never fails the caller.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, audience: Audience, notification: DialerNotification);
}

/// Fan-out over a tokio broadcast channel
pub struct BroadcastNotifier {
    tx: broadcast::Sender<NotificationEnvelope>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl NotificationSink for BroadcastNotifier {
    fn publish(&self, audience: Audience, notification: DialerNotification) {
        let envelope = NotificationEnvelope {
            audience,
            at: Utc::now(),
            notification,
        };
        // No subscribers is fine
        if self.tx.send(envelope).is_err() {
            trace!("Notification dropped, nobody subscribed");
        }
    }
}
