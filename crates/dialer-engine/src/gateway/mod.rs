//! # Telephony Gateway Client
//!
//! The narrow command/event boundary to an external telephony control plane.
//! The engine never speaks SIP or RTP itself; it asks the telephony server to
//! originate channels, build mixing bridges, move channels into them and hang
//! them up, and it listens to the server's event stream to learn what actually
//! happened.
//!
//! ## Commands
//!
//! Every command can fail (server unreachable, target rejected, timeout).
//! Callers treat a failure as non-fatal and apply a local compensating state
//! change instead of propagating it; only [`GatewayError::NotConfigured`] is
//! fatal and pauses the affected campaign. [`with_timeout`] bounds every
//! command so a stalled server cannot block an event worker.
//!
//! ## Events
//!
//! [`TelephonyGateway::events`] hands out the inbound [`GatewayEvent`] stream.
//! Per channel the stream follows the lifecycle created → ringing → up →
//! destroyed, but delivery is at-least-once: handlers must tolerate duplicates
//! and must check recorded state before transitioning.
//!
//! Channel ids are chosen by the engine and passed in the originate request,
//! so an attempt is tracked before the server can report anything about it.
//!
//! ## Implementations
//!
//! - [`loopback::LoopbackGateway`]: in-process telephony server used by tests
//!   and demo runs. Records commands, lets the caller drive channel state and
//!   can be scripted to fail.
//! - [`ari::AriGateway`]: Asterisk REST Interface over HTTP with the event
//!   websocket.

pub mod ari;
pub mod events;
pub mod loopback;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use events::{CallType, ChannelMetadata, GatewayEvent, HangupCause};

use crate::config::{GatewayConfig, GatewayKind};
use crate::error::{DialerError, Result};
use crate::types::{BridgeId, ChannelId};

/// Failures reported by the telephony control plane
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("telephony server unreachable: {0}")]
    Unreachable(String),

    #[error("telephony command timed out: {0}")]
    Timeout(String),

    #[error("telephony server rejected the command: {0}")]
    Rejected(String),

    #[error("no such channel or bridge: {0}")]
    NotFound(String),

    #[error("telephony server not configured: {0}")]
    NotConfigured(String),

    #[error("unexpected response from telephony server: {0}")]
    Protocol(String),
}

impl GatewayError {
    /// Errors that retrying cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::NotConfigured(_))
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Inbound event stream of one telephony server
pub type EventStream = mpsc::Receiver<GatewayEvent>;

/// Request to place a new channel
#[derive(Debug, Clone)]
pub struct OriginateRequest {
    /// Engine-assigned channel id
    pub channel_id: ChannelId,
    /// Endpoint or route, e.g. `PJSIP/5551234@trunk` or `PJSIP/agent1001`
    pub endpoint: String,
    pub caller_id: Option<String>,
    /// Metadata echoed back in the channel's events
    pub variables: HashMap<String, String>,
    /// Ring timeout
    pub timeout: Duration,
}

/// Channel state as reported by the telephony server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Down,
    Ringing,
    Up,
    Other(String),
}

impl ChannelState {
    pub fn parse(state: &str) -> Self {
        match state {
            "Down" | "Rsrvd" | "OffHook" | "Dialing" => ChannelState::Down,
            "Ring" | "Ringing" => ChannelState::Ringing,
            "Up" => ChannelState::Up,
            other => ChannelState::Other(other.to_string()),
        }
    }
}

/// Point-in-time channel status
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub channel_id: ChannelId,
    pub state: ChannelState,
}

/// Registration state of an agent endpoint (softphone)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointState {
    Online,
    Offline,
    Unknown,
}

impl EndpointState {
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "online" => EndpointState::Online,
            "offline" => EndpointState::Offline,
            _ => EndpointState::Unknown,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, EndpointState::Online)
    }
}

/// Command/event client to one telephony server
#[async_trait]
pub trait TelephonyGateway: Send + Sync {
    /// Server id referenced by campaigns and sessions
    fn server_id(&self) -> &str;

    async fn originate(&self, request: OriginateRequest) -> GatewayResult<ChannelId>;

    async fn create_bridge(&self) -> GatewayResult<BridgeId>;

    async fn destroy_bridge(&self, bridge: &BridgeId) -> GatewayResult<()>;

    async fn add_channel_to_bridge(&self, bridge: &BridgeId, channel: &ChannelId)
        -> GatewayResult<()>;

    async fn hangup(&self, channel: &ChannelId) -> GatewayResult<()>;

    /// `None` when the channel does not exist
    async fn channel_status(&self, channel: &ChannelId) -> GatewayResult<Option<ChannelStatus>>;

    async fn endpoint_status(&self, endpoint: &str) -> GatewayResult<EndpointState>;

    /// Open the inbound event stream. Called once per connection by the
    /// event-consumer loop.
    async fn events(&self) -> GatewayResult<EventStream>;
}

/// Run a gateway command with a deadline
pub async fn with_timeout<T, F>(limit: Duration, operation: &str, command: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(limit, command).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(format!(
            "{} did not complete within {:?}",
            operation, limit
        ))),
    }
}

/// The telephony servers known to this engine, keyed by server id
#[derive(Clone, Default)]
pub struct GatewayPool {
    gateways: HashMap<String, Arc<dyn TelephonyGateway>>,
    default_server: Option<String>,
}

impl GatewayPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a gateway. The first one added becomes the default server.
    pub fn add(&mut self, gateway: Arc<dyn TelephonyGateway>) {
        let id = gateway.server_id().to_string();
        if self.default_server.is_none() {
            self.default_server = Some(id.clone());
        }
        self.gateways.insert(id, gateway);
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn TelephonyGateway>) -> Self {
        self.add(gateway);
        self
    }

    /// Build gateways from configuration
    pub fn from_config(configs: &[GatewayConfig]) -> Result<Self> {
        let mut pool = Self::new();
        for config in configs {
            let gateway: Arc<dyn TelephonyGateway> = match config.kind {
                GatewayKind::Loopback => Arc::new(loopback::LoopbackGateway::new(&config.id)),
                GatewayKind::Ari => Arc::new(ari::AriGateway::new(config)?),
            };
            pool.add(gateway);
        }
        Ok(pool)
    }

    /// Resolve a campaign's server, falling back to the default server
    pub fn resolve(&self, server_id: Option<&str>) -> Result<Arc<dyn TelephonyGateway>> {
        let id = match server_id {
            Some(id) => id,
            None => self
                .default_server
                .as_deref()
                .ok_or_else(|| GatewayError::NotConfigured("no telephony server configured".into()))?,
        };
        self.gateways.get(id).cloned().ok_or_else(|| {
            DialerError::from(GatewayError::NotConfigured(format!(
                "telephony server '{}' is not configured",
                id
            )))
        })
    }

    pub fn get(&self, server_id: &str) -> Option<Arc<dyn TelephonyGateway>> {
        self.gateways.get(server_id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn TelephonyGateway>> {
        self.gateways.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_resolves_default_and_named_servers() {
        let pool = GatewayPool::new()
            .with_gateway(Arc::new(loopback::LoopbackGateway::new("pbx1")))
            .with_gateway(Arc::new(loopback::LoopbackGateway::new("pbx2")));

        assert_eq!(pool.resolve(None).unwrap().server_id(), "pbx1");
        assert_eq!(pool.resolve(Some("pbx2")).unwrap().server_id(), "pbx2");

        let missing = pool.resolve(Some("pbx9")).err().unwrap();
        assert!(missing.is_fatal_config());
    }

    #[test]
    fn test_empty_pool_is_fatal() {
        let pool = GatewayPool::new();
        assert!(pool.resolve(None).err().unwrap().is_fatal_config());
    }

    #[tokio::test]
    async fn test_with_timeout_reports_timeout() {
        let result: GatewayResult<()> = with_timeout(Duration::from_millis(10), "originate", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Timeout(_))));
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!(ChannelState::parse("Up"), ChannelState::Up);
        assert_eq!(ChannelState::parse("Ringing"), ChannelState::Ringing);
        assert!(EndpointState::parse("ONLINE").is_registered());
        assert!(!EndpointState::parse("unavailable").is_registered());
    }
}
