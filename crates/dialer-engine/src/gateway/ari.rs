//! Asterisk REST Interface gateway.
//!
//! Commands go over HTTP; events arrive on the `/events` websocket for the
//! configured Stasis application. The websocket is reconnected with backoff
//! for as long as the consumer holds the event stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::{
    ChannelMetadata, ChannelState, ChannelStatus, EndpointState, EventStream, GatewayError,
    GatewayEvent, GatewayResult, HangupCause, OriginateRequest, TelephonyGateway,
};
use crate::config::GatewayConfig;
use crate::error::{DialerError, Result};
use crate::types::{BridgeId, ChannelId};

const EVENT_BUFFER: usize = 4096;
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Channel and endpoint payloads inside ARI events
#[derive(Debug, Deserialize)]
struct AriChannel {
    id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    channelvars: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AriEndpoint {
    technology: String,
    resource: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AriEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<AriChannel>,
    #[serde(default)]
    endpoint: Option<AriEndpoint>,
    #[serde(default)]
    cause: Option<u16>,
    #[serde(default)]
    variable: Option<String>,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AriId {
    id: String,
}

pub struct AriGateway {
    server_id: String,
    base_url: String,
    username: String,
    password: String,
    app: String,
    client: Client,
    /// Variables of channels we originated, so events can be correlated
    /// without a round trip per channel
    originated: Arc<DashMap<ChannelId, HashMap<String, String>>>,
}

impl AriGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| DialerError::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            server_id: config.id.clone(),
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            app: config.app.clone(),
            client,
            originated: Arc::new(DashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn events_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!(
            "{}/events?app={}&api_key={}:{}&subscribeAll=true",
            ws_base, self.app, self.username, self.password
        )
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.basic_auth(&self.username, Some(&self.password))
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> GatewayResult<reqwest::Response> {
        let response = self.authed(builder).send().await.map_err(|e| map_http_error(what, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => GatewayError::NotFound(format!("{}: {}", what, body)),
            s if s.is_client_error() => GatewayError::Rejected(format!("{} ({}): {}", what, s, body)),
            s => GatewayError::Unreachable(format!("{} ({}): {}", what, s, body)),
        })
    }
}

/// Variables registered for an originate in flight. Dropped unkept, which
/// includes a caller's timeout cancelling the request, the entry goes away.
struct PendingOriginate<'a> {
    originated: &'a DashMap<ChannelId, HashMap<String, String>>,
    channel_id: ChannelId,
    kept: bool,
}

impl<'a> PendingOriginate<'a> {
    fn register(
        originated: &'a DashMap<ChannelId, HashMap<String, String>>,
        channel_id: ChannelId,
        variables: HashMap<String, String>,
    ) -> Self {
        originated.insert(channel_id.clone(), variables);
        Self {
            originated,
            channel_id,
            kept: false,
        }
    }

    fn keep(&mut self) {
        self.kept = true;
    }
}

impl Drop for PendingOriginate<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.originated.remove(&self.channel_id);
        }
    }
}

fn map_http_error(what: &str, e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(format!("{}: {}", what, e))
    } else if e.is_connect() {
        GatewayError::Unreachable(format!("{}: {}", what, e))
    } else {
        GatewayError::Protocol(format!("{}: {}", what, e))
    }
}

fn variables_of(channel: &AriChannel) -> HashMap<String, String> {
    channel
        .channelvars
        .iter()
        .filter_map(|(name, value)| match value {
            serde_json::Value::String(s) => Some((name.clone(), s.clone())),
            serde_json::Value::Null => None,
            other => Some((name.clone(), other.to_string())),
        })
        .collect()
}

/// Translate one ARI event into the engine's vocabulary. Events the engine
/// does not care about map to `None`.
fn translate_event(
    event: AriEvent,
    originated: &DashMap<ChannelId, HashMap<String, String>>,
) -> Option<GatewayEvent> {
    match event.kind.as_str() {
        "StasisStart" => {
            let channel = event.channel?;
            let channel_id = ChannelId(channel.id.clone());
            let metadata = match originated.get(&channel_id) {
                Some(variables) => ChannelMetadata::from_variables(&variables),
                None => ChannelMetadata::from_variables(&variables_of(&channel)),
            };
            Some(GatewayEvent::ChannelCreated {
                channel_id,
                metadata,
            })
        }
        "ChannelStateChange" => {
            let channel = event.channel?;
            Some(GatewayEvent::ChannelStateChanged {
                channel_id: ChannelId(channel.id),
                state: ChannelState::parse(&channel.state),
            })
        }
        "ChannelDestroyed" => {
            let channel = event.channel?;
            let channel_id = ChannelId(channel.id);
            originated.remove(&channel_id);
            Some(GatewayEvent::ChannelDestroyed {
                channel_id,
                cause: HangupCause::from_q850(event.cause.unwrap_or(16)),
            })
        }
        "ChannelVarset" => {
            let is_machine = event.variable.as_deref() == Some("AMDSTATUS")
                && event.value.as_deref() == Some("MACHINE");
            if !is_machine {
                return None;
            }
            let channel = event.channel?;
            Some(GatewayEvent::MachineDetected {
                channel_id: ChannelId(channel.id),
            })
        }
        "EndpointStateChange" => {
            let endpoint = event.endpoint?;
            Some(GatewayEvent::EndpointStateChanged {
                endpoint: format!("{}/{}", endpoint.technology, endpoint.resource),
                state: endpoint
                    .state
                    .as_deref()
                    .map(EndpointState::parse)
                    .unwrap_or(EndpointState::Unknown),
            })
        }
        _ => None,
    }
}

/// Pump the websocket into `tx` until the receiver goes away
async fn run_event_socket(
    server_id: String,
    url: String,
    originated: Arc<DashMap<ChannelId, HashMap<String, String>>>,
    tx: mpsc::Sender<GatewayEvent>,
) {
    let mut delay = Duration::from_millis(500);

    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((mut socket, _)) => {
                info!("🔌 Connected to event stream of {}", server_id);
                delay = Duration::from_millis(500);

                while let Some(message) = socket.next().await {
                    let text = match message {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!("⚠️ Event stream of {} failed: {}", server_id, e);
                            break;
                        }
                    };

                    let event: AriEvent = match serde_json::from_str(text.as_str()) {
                        Ok(event) => event,
                        Err(e) => {
                            debug!("Ignoring unparseable event from {}: {}", server_id, e);
                            continue;
                        }
                    };

                    if let Some(event) = translate_event(event, &originated) {
                        if tx.send(event).await.is_err() {
                            debug!("Event consumer for {} is gone, closing stream", server_id);
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                error!("❌ Cannot connect to event stream of {}: {}", server_id, e);
            }
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

#[async_trait]
impl TelephonyGateway for AriGateway {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn originate(&self, request: OriginateRequest) -> GatewayResult<ChannelId> {
        let mut query = vec![
            ("endpoint", request.endpoint.clone()),
            ("app", self.app.clone()),
            ("timeout", request.timeout.as_secs().to_string()),
        ];
        if let Some(caller_id) = &request.caller_id {
            query.push(("callerId", caller_id.clone()));
        }

        let mut pending = PendingOriginate::register(
            &self.originated,
            request.channel_id.clone(),
            request.variables.clone(),
        );

        let builder = self
            .client
            .post(self.url(&format!("/channels/{}", request.channel_id)))
            .query(&query)
            .json(&serde_json::json!({ "variables": request.variables }));

        let response = self.send(builder, "originate").await?;
        // The server accepted the channel; its events will need the variables
        pending.keep();
        let channel: AriId = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;
        Ok(ChannelId(channel.id))
    }

    async fn create_bridge(&self) -> GatewayResult<BridgeId> {
        let builder = self
            .client
            .post(self.url("/bridges"))
            .query(&[("type", "mixing")]);
        let response = self.send(builder, "create bridge").await?;
        let bridge: AriId = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;
        Ok(BridgeId(bridge.id))
    }

    async fn destroy_bridge(&self, bridge: &BridgeId) -> GatewayResult<()> {
        let builder = self.client.delete(self.url(&format!("/bridges/{}", bridge)));
        self.send(builder, "destroy bridge").await.map(|_| ())
    }

    async fn add_channel_to_bridge(
        &self,
        bridge: &BridgeId,
        channel: &ChannelId,
    ) -> GatewayResult<()> {
        let builder = self
            .client
            .post(self.url(&format!("/bridges/{}/addChannel", bridge)))
            .query(&[("channel", channel.as_str())]);
        self.send(builder, "add channel to bridge").await.map(|_| ())
    }

    async fn hangup(&self, channel: &ChannelId) -> GatewayResult<()> {
        let builder = self.client.delete(self.url(&format!("/channels/{}", channel)));
        self.send(builder, "hangup").await.map(|_| ())
    }

    async fn channel_status(&self, channel: &ChannelId) -> GatewayResult<Option<ChannelStatus>> {
        let builder = self.client.get(self.url(&format!("/channels/{}", channel)));
        match self.send(builder, "channel status").await {
            Ok(response) => {
                let body: AriChannel = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::Protocol(e.to_string()))?;
                Ok(Some(ChannelStatus {
                    channel_id: ChannelId(body.id),
                    state: ChannelState::parse(&body.state),
                }))
            }
            Err(GatewayError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn endpoint_status(&self, endpoint: &str) -> GatewayResult<EndpointState> {
        let builder = self.client.get(self.url(&format!("/endpoints/{}", endpoint)));
        match self.send(builder, "endpoint status").await {
            Ok(response) => {
                let body: AriEndpoint = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::Protocol(e.to_string()))?;
                Ok(body
                    .state
                    .as_deref()
                    .map(EndpointState::parse)
                    .unwrap_or(EndpointState::Unknown))
            }
            Err(GatewayError::NotFound(_)) => Ok(EndpointState::Offline),
            Err(e) => Err(e),
        }
    }

    async fn events(&self) -> GatewayResult<EventStream> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(run_event_socket(
            self.server_id.clone(),
            self.events_url(),
            self.originated.clone(),
            tx,
        ));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayKind;
    use crate::gateway::events::CallType;

    fn parse(json: &str) -> AriEvent {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_stasis_start_uses_originated_variables() {
        let originated = DashMap::new();
        let metadata = ChannelMetadata::customer(crate::types::CallId::new(), 3, 9, "5550100");
        originated.insert(ChannelId::from("chan-1"), metadata.to_variables());

        let event = translate_event(
            parse(r#"{"type":"StasisStart","channel":{"id":"chan-1","state":"Down"}}"#),
            &originated,
        );
        match event {
            Some(GatewayEvent::ChannelCreated { channel_id, metadata: parsed }) => {
                assert_eq!(channel_id, ChannelId::from("chan-1"));
                assert_eq!(parsed, metadata);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stasis_start_falls_back_to_channelvars() {
        let originated = DashMap::new();
        let event = translate_event(
            parse(
                r#"{"type":"StasisStart","channel":{"id":"x","state":"Up",
                    "channelvars":{"CALL_TYPE":"agent_leg","AGENT_ID":"1001","LEAD_ID":null}}}"#,
            ),
            &originated,
        );
        match event {
            Some(GatewayEvent::ChannelCreated { metadata, .. }) => {
                assert_eq!(metadata.call_type, Some(CallType::AgentLeg));
                assert_eq!(metadata.agent_id.unwrap().as_str(), "1001");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_destroyed_and_machine_events() {
        let originated = DashMap::new();
        originated.insert(ChannelId::from("c"), HashMap::new());

        let destroyed = translate_event(
            parse(r#"{"type":"ChannelDestroyed","cause":17,"channel":{"id":"c","state":"Down"}}"#),
            &originated,
        );
        assert!(matches!(
            destroyed,
            Some(GatewayEvent::ChannelDestroyed { cause: HangupCause::Busy, .. })
        ));
        assert!(originated.is_empty());

        let machine = translate_event(
            parse(
                r#"{"type":"ChannelVarset","variable":"AMDSTATUS","value":"MACHINE",
                    "channel":{"id":"c","state":"Up"}}"#,
            ),
            &originated,
        );
        assert!(matches!(machine, Some(GatewayEvent::MachineDetected { .. })));

        let other_var = translate_event(
            parse(r#"{"type":"ChannelVarset","variable":"FOO","value":"1","channel":{"id":"c"}}"#),
            &originated,
        );
        assert!(other_var.is_none());
    }

    #[test]
    fn test_endpoint_state_change() {
        let event = translate_event(
            parse(
                r#"{"type":"EndpointStateChange",
                    "endpoint":{"technology":"PJSIP","resource":"1001","state":"online"}}"#,
            ),
            &DashMap::new(),
        );
        match event {
            Some(GatewayEvent::EndpointStateChanged { endpoint, state }) => {
                assert_eq!(endpoint, "PJSIP/1001");
                assert_eq!(state, EndpointState::Online);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn config(url: String) -> GatewayConfig {
        GatewayConfig {
            id: "pbx1".to_string(),
            kind: GatewayKind::Ari,
            url,
            username: "dialer".to_string(),
            password: "pw".to_string(),
            app: "autodialer".to_string(),
        }
    }

    #[tokio::test]
    async fn test_cancelled_originate_forgets_variables() {
        // Accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let gateway = AriGateway::new(&config(format!("http://{}/ari", addr))).unwrap();
        let metadata = ChannelMetadata::customer(crate::types::CallId::new(), 1, 1, "5550100");
        let request = OriginateRequest {
            channel_id: ChannelId::from("slow-1"),
            endpoint: "PJSIP/5550100@trunk".to_string(),
            caller_id: None,
            variables: metadata.to_variables(),
            timeout: Duration::from_secs(30),
        };

        let result = crate::gateway::with_timeout(
            Duration::from_millis(100),
            "originate",
            gateway.originate(request),
        )
        .await;
        assert!(matches!(result, Err(GatewayError::Timeout(_))));
        assert!(gateway.originated.is_empty());

        server.abort();
    }

    #[tokio::test]
    async fn test_refused_originate_forgets_variables() {
        // Nothing listens on a port we just released
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let gateway = AriGateway::new(&config(format!("http://{}/ari", addr))).unwrap();
        let request = OriginateRequest {
            channel_id: ChannelId::from("refused-1"),
            endpoint: "PJSIP/5550100@trunk".to_string(),
            caller_id: None,
            variables: HashMap::new(),
            timeout: Duration::from_secs(30),
        };
        assert!(gateway.originate(request).await.is_err());
        assert!(gateway.originated.is_empty());
    }

    #[test]
    fn test_events_url() {
        let gateway = AriGateway::new(&GatewayConfig {
            id: "pbx1".to_string(),
            kind: GatewayKind::Ari,
            url: "http://pbx1:8088/ari/".to_string(),
            username: "dialer".to_string(),
            password: "pw".to_string(),
            app: "autodialer".to_string(),
        })
        .unwrap();
        assert_eq!(
            gateway.events_url(),
            "ws://pbx1:8088/ari/events?app=autodialer&api_key=dialer:pw&subscribeAll=true"
        );
    }
}
