//! In-process telephony server.
//!
//! Behaves like a well-mannered control plane: commands mutate a local model
//! of channels and bridges and emit the events a real server would. Agent legs
//! answer immediately; customer channels stay down until the caller drives them
//! with [`LoopbackGateway::ring`], [`LoopbackGateway::answer`] or
//! [`LoopbackGateway::remote_hangup`]. Individual commands can be told to fail.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    ChannelMetadata, ChannelState, ChannelStatus, EndpointState, EventStream, GatewayError,
    GatewayEvent, GatewayResult, HangupCause, OriginateRequest, TelephonyGateway,
};
use crate::gateway::events::CallType;
use crate::types::{BridgeId, ChannelId};

const EVENT_BUFFER: usize = 10_000;

/// Commands that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailOp {
    Originate,
    CreateBridge,
    DestroyBridge,
    AddChannel,
    Hangup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailMode {
    Once,
    Always,
}

/// A command as received, for assertions
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCommand {
    Originate {
        channel_id: ChannelId,
        endpoint: String,
        metadata: ChannelMetadata,
    },
    CreateBridge(BridgeId),
    DestroyBridge(BridgeId),
    AddChannel {
        bridge: BridgeId,
        channel: ChannelId,
    },
    Hangup(ChannelId),
}

#[derive(Debug, Clone)]
struct LoopbackChannel {
    state: ChannelState,
}

pub struct LoopbackGateway {
    server_id: String,
    events_tx: mpsc::Sender<GatewayEvent>,
    events_rx: Mutex<Option<EventStream>>,
    channels: DashMap<ChannelId, LoopbackChannel>,
    bridges: DashMap<BridgeId, HashSet<ChannelId>>,
    endpoints: DashMap<String, EndpointState>,
    commands: Mutex<Vec<GatewayCommand>>,
    failures: Mutex<HashMap<FailOp, FailMode>>,
    next_bridge: AtomicU64,
}

impl LoopbackGateway {
    pub fn new(server_id: &str) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            server_id: server_id.to_string(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            channels: DashMap::new(),
            bridges: DashMap::new(),
            endpoints: DashMap::new(),
            commands: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            next_bridge: AtomicU64::new(1),
        }
    }

    fn emit(&self, event: GatewayEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            warn!("Loopback event dropped: {}", e);
        }
    }

    fn check_failure(&self, op: FailOp) -> GatewayResult<()> {
        let mut failures = self.failures.lock();
        match failures.get(&op).copied() {
            Some(FailMode::Once) => {
                failures.remove(&op);
                Err(GatewayError::Unreachable(format!("scripted {:?} failure", op)))
            }
            Some(FailMode::Always) => {
                Err(GatewayError::Unreachable(format!("scripted {:?} failure", op)))
            }
            None => Ok(()),
        }
    }

    fn record(&self, command: GatewayCommand) {
        self.commands.lock().push(command);
    }

    fn set_state(&self, channel_id: &ChannelId, state: ChannelState) -> bool {
        match self.channels.get_mut(channel_id) {
            Some(mut channel) => {
                channel.state = state.clone();
                drop(channel);
                self.emit(GatewayEvent::ChannelStateChanged {
                    channel_id: channel_id.clone(),
                    state,
                });
                true
            }
            None => false,
        }
    }

    fn destroy(&self, channel_id: &ChannelId, cause: HangupCause) -> bool {
        if self.channels.remove(channel_id).is_none() {
            return false;
        }
        for mut members in self.bridges.iter_mut() {
            members.remove(channel_id);
        }
        self.emit(GatewayEvent::ChannelDestroyed {
            channel_id: channel_id.clone(),
            cause,
        });
        true
    }

    /// Make the next call of `op` fail
    pub fn fail_next(&self, op: FailOp) {
        self.failures.lock().insert(op, FailMode::Once);
    }

    /// Make every call of `op` fail until cleared
    pub fn fail_always(&self, op: FailOp) {
        self.failures.lock().insert(op, FailMode::Always);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Remote party starts ringing
    pub fn ring(&self, channel_id: &ChannelId) -> bool {
        self.set_state(channel_id, ChannelState::Ringing)
    }

    /// Remote party picks up
    pub fn answer(&self, channel_id: &ChannelId) -> bool {
        self.set_state(channel_id, ChannelState::Up)
    }

    /// Remote party hangs up or the network tears the channel down
    pub fn remote_hangup(&self, channel_id: &ChannelId, cause: HangupCause) -> bool {
        self.destroy(channel_id, cause)
    }

    /// Answering machine detection fired on this channel
    pub fn detect_machine(&self, channel_id: &ChannelId) -> bool {
        if !self.channels.contains_key(channel_id) {
            return false;
        }
        self.emit(GatewayEvent::MachineDetected {
            channel_id: channel_id.clone(),
        });
        true
    }

    /// Change an endpoint's registration and emit the event
    pub fn set_endpoint_state(&self, endpoint: &str, state: EndpointState) {
        self.endpoints.insert(endpoint.to_string(), state);
        self.emit(GatewayEvent::EndpointStateChanged {
            endpoint: endpoint.to_string(),
            state,
        });
    }

    pub fn commands(&self) -> Vec<GatewayCommand> {
        self.commands.lock().clone()
    }

    /// Customer channels originated so far, in order
    pub fn customer_channels(&self) -> Vec<ChannelId> {
        self.commands
            .lock()
            .iter()
            .filter_map(|command| match command {
                GatewayCommand::Originate {
                    channel_id,
                    metadata,
                    ..
                } if metadata.call_type == Some(CallType::Autodial) => Some(channel_id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn hangups(&self) -> Vec<ChannelId> {
        self.commands
            .lock()
            .iter()
            .filter_map(|command| match command {
                GatewayCommand::Hangup(channel) => Some(channel.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_live(&self, channel_id: &ChannelId) -> bool {
        self.channels.contains_key(channel_id)
    }

    pub fn bridge_members(&self, bridge: &BridgeId) -> Vec<ChannelId> {
        self.bridges
            .get(bridge)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TelephonyGateway for LoopbackGateway {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn originate(&self, request: OriginateRequest) -> GatewayResult<ChannelId> {
        let metadata = ChannelMetadata::from_variables(&request.variables);
        self.record(GatewayCommand::Originate {
            channel_id: request.channel_id.clone(),
            endpoint: request.endpoint.clone(),
            metadata: metadata.clone(),
        });
        self.check_failure(FailOp::Originate)?;

        let is_agent_leg = metadata.call_type == Some(CallType::AgentLeg);
        self.channels.insert(
            request.channel_id.clone(),
            LoopbackChannel {
                state: ChannelState::Down,
            },
        );
        self.emit(GatewayEvent::ChannelCreated {
            channel_id: request.channel_id.clone(),
            metadata,
        });

        if is_agent_leg {
            self.set_state(&request.channel_id, ChannelState::Up);
        }

        debug!("Loopback originate {} -> {}", request.channel_id, request.endpoint);
        Ok(request.channel_id)
    }

    async fn create_bridge(&self) -> GatewayResult<BridgeId> {
        self.check_failure(FailOp::CreateBridge)?;
        let id = BridgeId(format!(
            "{}-bridge-{}",
            self.server_id,
            self.next_bridge.fetch_add(1, Ordering::SeqCst)
        ));
        self.bridges.insert(id.clone(), HashSet::new());
        self.record(GatewayCommand::CreateBridge(id.clone()));
        Ok(id)
    }

    async fn destroy_bridge(&self, bridge: &BridgeId) -> GatewayResult<()> {
        self.record(GatewayCommand::DestroyBridge(bridge.clone()));
        self.check_failure(FailOp::DestroyBridge)?;
        self.bridges
            .remove(bridge)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(bridge.to_string()))
    }

    async fn add_channel_to_bridge(
        &self,
        bridge: &BridgeId,
        channel: &ChannelId,
    ) -> GatewayResult<()> {
        self.record(GatewayCommand::AddChannel {
            bridge: bridge.clone(),
            channel: channel.clone(),
        });
        self.check_failure(FailOp::AddChannel)?;

        if !self.channels.contains_key(channel) {
            return Err(GatewayError::NotFound(channel.to_string()));
        }
        match self.bridges.get_mut(bridge) {
            Some(mut members) => {
                members.insert(channel.clone());
                Ok(())
            }
            None => Err(GatewayError::NotFound(bridge.to_string())),
        }
    }

    async fn hangup(&self, channel: &ChannelId) -> GatewayResult<()> {
        self.record(GatewayCommand::Hangup(channel.clone()));
        self.check_failure(FailOp::Hangup)?;
        if self.destroy(channel, HangupCause::Normal) {
            Ok(())
        } else {
            Err(GatewayError::NotFound(channel.to_string()))
        }
    }

    async fn channel_status(&self, channel: &ChannelId) -> GatewayResult<Option<ChannelStatus>> {
        Ok(self.channels.get(channel).map(|c| ChannelStatus {
            channel_id: channel.clone(),
            state: c.state.clone(),
        }))
    }

    async fn endpoint_status(&self, endpoint: &str) -> GatewayResult<EndpointState> {
        Ok(self
            .endpoints
            .get(endpoint)
            .map(|state| *state)
            .unwrap_or(EndpointState::Online))
    }

    async fn events(&self) -> GatewayResult<EventStream> {
        self.events_rx
            .lock()
            .take()
            .ok_or_else(|| GatewayError::Protocol("event stream already taken".to_string()))
    }
}
