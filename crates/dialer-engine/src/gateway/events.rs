use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{ChannelState, EndpointState};
use crate::types::{AgentId, CallId, CampaignId, ChannelId, LeadId};

pub const VAR_CALL_TYPE: &str = "CALL_TYPE";
pub const VAR_CAMPAIGN_ID: &str = "CAMPAIGN_ID";
pub const VAR_LEAD_ID: &str = "LEAD_ID";
pub const VAR_AGENT_ID: &str = "AGENT_ID";
pub const VAR_CALL_ID: &str = "CALL_ID";
pub const VAR_CUSTOMER_NUMBER: &str = "CUSTOMER_NUMBER";

/// What a channel is for, tagged at origination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallType {
    /// Outbound customer call placed by the scheduler
    Autodial,
    /// The agent's own leg, held open for the whole session
    AgentLeg,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Autodial => "autodial",
            CallType::AgentLeg => "agent_leg",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "autodial" => Some(CallType::Autodial),
            "agent_leg" => Some(CallType::AgentLeg),
            _ => None,
        }
    }
}

/// Correlation data carried as channel variables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelMetadata {
    pub call_type: Option<CallType>,
    pub campaign_id: Option<CampaignId>,
    pub lead_id: Option<LeadId>,
    pub agent_id: Option<AgentId>,
    pub call_id: Option<CallId>,
    pub customer_number: Option<String>,
}

impl ChannelMetadata {
    pub fn customer(call_id: CallId, campaign_id: CampaignId, lead_id: LeadId, number: &str) -> Self {
        Self {
            call_type: Some(CallType::Autodial),
            campaign_id: Some(campaign_id),
            lead_id: Some(lead_id),
            call_id: Some(call_id),
            customer_number: Some(number.to_string()),
            agent_id: None,
        }
    }

    pub fn agent_leg(agent_id: &AgentId, campaign_id: CampaignId) -> Self {
        Self {
            call_type: Some(CallType::AgentLeg),
            campaign_id: Some(campaign_id),
            agent_id: Some(agent_id.clone()),
            ..Default::default()
        }
    }

    /// Parse from channel variables. Unknown or malformed values are dropped.
    pub fn from_variables(variables: &HashMap<String, String>) -> Self {
        Self {
            call_type: variables.get(VAR_CALL_TYPE).and_then(|v| CallType::parse(v)),
            campaign_id: variables.get(VAR_CAMPAIGN_ID).and_then(|v| v.parse().ok()),
            lead_id: variables.get(VAR_LEAD_ID).and_then(|v| v.parse().ok()),
            agent_id: variables.get(VAR_AGENT_ID).map(|v| AgentId(v.clone())),
            call_id: variables.get(VAR_CALL_ID).and_then(|v| v.parse().ok()),
            customer_number: variables.get(VAR_CUSTOMER_NUMBER).cloned(),
        }
    }

    pub fn to_variables(&self) -> HashMap<String, String> {
        let mut variables = HashMap::new();
        if let Some(call_type) = self.call_type {
            variables.insert(VAR_CALL_TYPE.to_string(), call_type.as_str().to_string());
        }
        if let Some(campaign_id) = self.campaign_id {
            variables.insert(VAR_CAMPAIGN_ID.to_string(), campaign_id.to_string());
        }
        if let Some(lead_id) = self.lead_id {
            variables.insert(VAR_LEAD_ID.to_string(), lead_id.to_string());
        }
        if let Some(agent_id) = &self.agent_id {
            variables.insert(VAR_AGENT_ID.to_string(), agent_id.to_string());
        }
        if let Some(call_id) = self.call_id {
            variables.insert(VAR_CALL_ID.to_string(), call_id.to_string());
        }
        if let Some(number) = &self.customer_number {
            variables.insert(VAR_CUSTOMER_NUMBER.to_string(), number.clone());
        }
        variables
    }
}

/// Why a channel went away, from its Q.850 cause code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HangupCause {
    Normal,
    Busy,
    NoAnswer,
    Failed,
    Other(u16),
}

impl HangupCause {
    pub fn from_q850(code: u16) -> Self {
        match code {
            16 => HangupCause::Normal,
            17 => HangupCause::Busy,
            18 | 19 => HangupCause::NoAnswer,
            1 | 3 | 21 | 27 | 28 | 34 | 38 | 41 | 42 | 58 => HangupCause::Failed,
            other => HangupCause::Other(other),
        }
    }

    pub fn label(&self) -> String {
        match self {
            HangupCause::Normal => "normal".to_string(),
            HangupCause::Busy => "busy".to_string(),
            HangupCause::NoAnswer => "no_answer".to_string(),
            HangupCause::Failed => "failed".to_string(),
            HangupCause::Other(code) => format!("q850_{}", code),
        }
    }
}

/// Inbound telephony event
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    ChannelCreated {
        channel_id: ChannelId,
        metadata: ChannelMetadata,
    },
    ChannelStateChanged {
        channel_id: ChannelId,
        state: ChannelState,
    },
    ChannelDestroyed {
        channel_id: ChannelId,
        cause: HangupCause,
    },
    /// Answering machine detection classified the callee as a machine
    MachineDetected {
        channel_id: ChannelId,
    },
    EndpointStateChanged {
        endpoint: String,
        state: EndpointState,
    },
}

impl GatewayEvent {
    /// Channel the event belongs to, used to shard events across workers
    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            GatewayEvent::ChannelCreated { channel_id, .. }
            | GatewayEvent::ChannelStateChanged { channel_id, .. }
            | GatewayEvent::ChannelDestroyed { channel_id, .. }
            | GatewayEvent::MachineDetected { channel_id } => Some(channel_id),
            GatewayEvent::EndpointStateChanged { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::ChannelCreated { .. } => "ChannelCreated",
            GatewayEvent::ChannelStateChanged { .. } => "ChannelStateChanged",
            GatewayEvent::ChannelDestroyed { .. } => "ChannelDestroyed",
            GatewayEvent::MachineDetected { .. } => "MachineDetected",
            GatewayEvent::EndpointStateChanged { .. } => "EndpointStateChanged",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_survives_channel_variables() {
        let call_id = CallId::new();
        let metadata = ChannelMetadata::customer(call_id, 7, 42, "5550100");
        let parsed = ChannelMetadata::from_variables(&metadata.to_variables());
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn test_malformed_variables_are_dropped() {
        let mut variables = HashMap::new();
        variables.insert(VAR_CALL_TYPE.to_string(), "conference".to_string());
        variables.insert(VAR_LEAD_ID.to_string(), "abc".to_string());
        let parsed = ChannelMetadata::from_variables(&variables);
        assert_eq!(parsed.call_type, None);
        assert_eq!(parsed.lead_id, None);
    }

    #[test]
    fn test_q850_mapping() {
        assert_eq!(HangupCause::from_q850(17), HangupCause::Busy);
        assert_eq!(HangupCause::from_q850(19), HangupCause::NoAnswer);
        assert_eq!(HangupCause::from_q850(34), HangupCause::Failed);
        assert_eq!(HangupCause::from_q850(102), HangupCause::Other(102));
    }
}
