//! Shared fixtures: an engine wired to a loopback telephony server and an
//! in-memory database.

#![allow(dead_code)]

use std::sync::Arc;

use autodialer_engine::gateway::EventStream;
use autodialer_engine::notify::NotificationEnvelope;
use autodialer_engine::prelude::*;
use tokio::sync::broadcast;

pub const SERVER: &str = "loopback";

pub struct Harness {
    pub engine: Arc<DialerEngine>,
    pub gateway: Arc<LoopbackGateway>,
    pub events: EventStream,
    pub notifications: broadcast::Receiver<NotificationEnvelope>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::for_testing()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let db = DatabaseManager::new_in_memory()
            .await
            .expect("in-memory database");
        let gateway = Arc::new(LoopbackGateway::new(SERVER));
        let pool = GatewayPool::new().with_gateway(gateway.clone());
        let notifier = Arc::new(BroadcastNotifier::new(4096));
        let notifications = notifier.subscribe();
        let engine = Arc::new(DialerEngine::new(config, db, pool, notifier));
        let events = gateway.events().await.expect("event stream");

        Self {
            engine,
            gateway,
            events,
            notifications,
        }
    }

    pub fn db(&self) -> &DatabaseManager {
        self.engine.database()
    }

    /// Handle queued gateway events until none are left. Handlers issue
    /// commands that queue further events, so drain repeatedly.
    pub async fn pump(&mut self) -> usize {
        let mut total = 0;
        loop {
            let handled = self.engine.pump_events(SERVER, &mut self.events).await;
            if handled == 0 {
                return total;
            }
            total += handled;
        }
    }

    pub async fn campaign(&self, configure: impl FnOnce(&mut Campaign)) -> CampaignId {
        let mut campaign = Campaign::new("test campaign");
        configure(&mut campaign);
        self.db()
            .create_campaign(&campaign)
            .await
            .expect("create campaign")
    }

    pub async fn leads(&self, campaign_id: CampaignId, count: usize) -> Vec<LeadId> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let lead = NewLead::new(campaign_id, format!("555{:04}", i));
            ids.push(self.db().create_lead(&lead).await.expect("create lead"));
        }
        ids
    }

    /// Log an agent in and let the agent leg come up
    pub async fn ready_agent(&mut self, agent: &str, campaign_id: CampaignId) -> AgentSession {
        let agent_id = AgentId::from(agent);
        self.engine
            .login(LoginRequest {
                agent_id: agent_id.clone(),
                campaign_id,
                endpoint: format!("PJSIP/{}", agent),
                server_id: None,
            })
            .await
            .expect("login");
        self.pump().await;

        let session = self.engine.session(&agent_id).expect("session");
        assert_eq!(session.state, SessionState::Ready, "agent {} not ready", agent);
        session
    }

    pub async fn tick(&mut self) -> usize {
        let placed = self.engine.run_scheduler_tick().await.expect("scheduler tick");
        self.pump().await;
        placed
    }

    /// Customer channels originated and still tracked as in flight
    pub fn live_customer_channels(&self) -> Vec<ChannelId> {
        self.gateway
            .customer_channels()
            .into_iter()
            .filter(|c| self.gateway.is_live(c))
            .collect()
    }

    pub async fn answer(&mut self, channel: &ChannelId) {
        assert!(self.gateway.answer(channel), "channel {} not live", channel);
        self.pump().await;
    }

    pub async fn hangup(&mut self, channel: &ChannelId, cause: HangupCause) {
        assert!(self.gateway.remote_hangup(channel, cause));
        self.pump().await;
    }

    pub fn attempt_state(&self, channel: &ChannelId) -> Option<AttemptState> {
        self.engine.calls().get(channel).map(|a| a.state)
    }

    /// Notifications published so far, in order
    pub fn drain_notifications(&mut self) -> Vec<DialerNotification> {
        let mut out = Vec::new();
        while let Ok(envelope) = self.notifications.try_recv() {
            out.push(envelope.notification);
        }
        out
    }
}
