//! Agent API
//!
//! The operations an agent desktop (or the HTTP surface in front of it)
//! needs: campaign login and logout, liveness, the availability toggle and
//! disposition submission. Supervisor-level reads and campaign pause/resume
//! live here too.

use std::sync::Arc;

use crate::agent::{AgentSession, LoginRequest};
use crate::disposition::{DispositionRequest, DispositionResult};
use crate::engine::{CampaignHealth, DialerEngine};
use crate::error::Result;
use crate::stats::DialerStats;
use crate::types::{AgentId, CampaignId};

/// Agent-facing API over a running engine
#[derive(Clone)]
pub struct AgentApi {
    engine: Arc<DialerEngine>,
}

impl AgentApi {
    pub fn new(engine: Arc<DialerEngine>) -> Self {
        Self { engine }
    }

    /// Log an agent into a campaign. The session starts in `connecting`
    /// and turns `ready` once the agent's phone has answered.
    pub async fn login(&self, request: LoginRequest) -> Result<AgentSession> {
        self.engine.login(request).await
    }

    /// Log out; deferred until the current call ends if there is one
    pub async fn logout(&self, agent_id: &AgentId) -> Result<AgentSession> {
        self.engine.logout(agent_id).await
    }

    /// Close the session at once, hanging up the customer call, the agent
    /// leg and the bridge
    pub async fn reset(&self, agent_id: &AgentId) -> Result<AgentSession> {
        self.engine.reset_session(agent_id).await
    }

    pub async fn heartbeat(&self, agent_id: &AgentId) -> Result<()> {
        self.engine.heartbeat(agent_id).await
    }

    pub async fn set_available(&self, agent_id: &AgentId, available: bool) -> Result<AgentSession> {
        self.engine.set_available(agent_id, available).await
    }

    pub fn session(&self, agent_id: &AgentId) -> Option<AgentSession> {
        self.engine.session(agent_id)
    }

    pub async fn submit_disposition(&self, request: DispositionRequest) -> Result<DispositionResult> {
        self.engine.submit_disposition(request).await
    }

    pub fn stats(&self) -> DialerStats {
        self.engine.stats()
    }

    pub async fn pause_campaign(&self, campaign_id: CampaignId, reason: Option<&str>) -> Result<()> {
        self.engine.pause_campaign(campaign_id, reason).await
    }

    pub async fn resume_campaign(&self, campaign_id: CampaignId) -> Result<()> {
        self.engine.resume_campaign(campaign_id).await
    }

    pub fn campaign_health(&self, campaign_id: CampaignId) -> Option<CampaignHealth> {
        self.engine.campaign_health(campaign_id)
    }

    pub fn engine(&self) -> &Arc<DialerEngine> {
        &self.engine
    }
}
