//! Agent session lifecycle: login, logout, heartbeats, wrap-up and the reaper

mod common;

use anyhow::Result;
use autodialer_engine::gateway::loopback::{FailOp, GatewayCommand};
use autodialer_engine::gateway::EndpointState;
use autodialer_engine::prelude::*;
use chrono::{Duration, Utc};
use common::Harness;
use serial_test::serial;

fn agent(id: &str) -> AgentId {
    AgentId::from(id)
}

fn login_request(id: &str, campaign_id: CampaignId) -> LoginRequest {
    LoginRequest {
        agent_id: agent(id),
        campaign_id,
        endpoint: format!("PJSIP/{}", id),
        server_id: None,
    }
}

/// Ready agent with a bridged customer call
async fn agent_on_call(h: &mut Harness, configure: impl FnOnce(&mut Campaign)) -> (CampaignId, ChannelId) {
    let campaign = h.campaign(configure).await;
    h.leads(campaign, 1).await;
    h.ready_agent("1001", campaign).await;
    assert_eq!(h.tick().await, 1);
    let channel = h.live_customer_channels().remove(0);
    h.answer(&channel).await;
    assert_eq!(h.engine.session(&agent("1001")).expect("session").state, SessionState::OnCall);
    (campaign, channel)
}

#[tokio::test]
#[serial]
async fn test_login_connects_then_goes_ready() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;

    let session = h.engine.login(login_request("1001", campaign)).await?;
    assert_eq!(session.state, SessionState::Connecting);
    assert!(session.bridge_id.is_some());

    h.pump().await;
    let session = h.engine.session(&agent("1001")).expect("session");
    assert_eq!(session.state, SessionState::Ready);
    assert!(session.available);
    assert!(session.endpoint_registered);

    let bridge = session.bridge_id.expect("bridge");
    let leg = session.agent_channel.expect("agent leg");
    assert_eq!(h.gateway.bridge_members(&bridge), vec![leg]);

    let history = h.db().list_agent_sessions(&agent("1001")).await?;
    assert_eq!(history.len(), 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_second_login_refused_while_live() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    h.ready_agent("1001", campaign).await;

    let err = h.engine.login(login_request("1001", campaign)).await.unwrap_err();
    assert!(matches!(err, DialerError::AlreadyExists(_)));

    // After logout the agent can come back
    h.engine.logout(&agent("1001")).await?;
    h.pump().await;
    h.ready_agent("1001", campaign).await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_login_to_unknown_campaign() -> Result<()> {
    let h = Harness::new().await;
    let err = h.engine.login(login_request("1001", 42)).await.unwrap_err();
    assert!(matches!(err, DialerError::NotFound(_)));
    assert!(h.engine.session(&agent("1001")).is_none());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_failed_bridge_setup_closes_session() -> Result<()> {
    let h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;

    h.gateway.fail_next(FailOp::CreateBridge);
    assert!(h.engine.login(login_request("1001", campaign)).await.is_err());

    let session = h.engine.session(&agent("1001")).expect("session");
    assert_eq!(session.state, SessionState::Error);
    assert!(session.end_reason.is_some());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_logout_when_ready_tears_down() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    let ready = h.ready_agent("1001", campaign).await;

    let closed = h.engine.logout(&agent("1001")).await?;
    h.pump().await;
    assert_eq!(closed.state, SessionState::Offline);

    let leg = ready.agent_channel.expect("agent leg");
    let bridge = ready.bridge_id.expect("bridge");
    assert!(!h.gateway.is_live(&leg));
    assert!(h.gateway.commands().contains(&GatewayCommand::DestroyBridge(bridge)));

    // Logging out twice finds nothing live
    assert!(matches!(
        h.engine.logout(&agent("1001")).await,
        Err(DialerError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_logout_during_call_waits_for_hangup() -> Result<()> {
    let mut h = Harness::new().await;
    let (_, channel) = agent_on_call(&mut h, |_| {}).await;

    let flagged = h.engine.logout(&agent("1001")).await?;
    assert_eq!(flagged.state, SessionState::OnCall);
    assert!(flagged.logout_requested);
    assert!(h.gateway.is_live(&channel), "logout must not drop the customer");

    h.hangup(&channel, HangupCause::Normal).await;
    let session = h.engine.session(&agent("1001")).expect("session");
    assert_eq!(session.state, SessionState::Offline);
    assert_eq!(session.end_reason.as_deref(), Some("logout"));
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_agent_leg_hangup_closes_session() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    let ready = h.ready_agent("1001", campaign).await;

    h.hangup(&ready.agent_channel.expect("agent leg"), HangupCause::Normal).await;

    let session = h.engine.session(&agent("1001")).expect("session");
    assert_eq!(session.state, SessionState::Error);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_unregistered_endpoint_not_dialed_for() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    h.leads(campaign, 5).await;
    h.ready_agent("1001", campaign).await;

    h.gateway.set_endpoint_state("PJSIP/1001", EndpointState::Offline);
    h.pump().await;
    assert!(!h.engine.session(&agent("1001")).expect("session").endpoint_registered);
    assert_eq!(h.tick().await, 0);

    h.gateway.set_endpoint_state("PJSIP/1001", EndpointState::Online);
    h.pump().await;
    assert_eq!(h.tick().await, 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_paused_agent_not_dialed_for() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    h.leads(campaign, 5).await;
    h.ready_agent("1001", campaign).await;

    let paused = h.engine.set_available(&agent("1001"), false).await?;
    assert_eq!(paused.state, SessionState::Ready);
    assert!(!paused.available);
    assert_eq!(h.tick().await, 0);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_missed_heartbeat_closes_session() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    let ready = h.ready_agent("1001", campaign).await;

    let quiet = h.engine.sweep_at(Utc::now() + Duration::seconds(200)).await?;
    assert_eq!(quiet.heartbeat_expired, 0);

    let report = h.engine.sweep_at(Utc::now() + Duration::seconds(400)).await?;
    assert_eq!(report.heartbeat_expired, 1);
    h.pump().await;

    let session = h.engine.session(&agent("1001")).expect("session");
    assert_eq!(session.state, SessionState::Offline);
    assert!(!h.gateway.is_live(&ready.agent_channel.expect("agent leg")));
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_heartbeat_refreshes_session() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    let ready = h.ready_agent("1001", campaign).await;

    h.engine.heartbeat(&agent("1001")).await?;
    let session = h.engine.session(&agent("1001")).expect("session");
    assert!(session.last_heartbeat >= ready.last_heartbeat);

    assert!(matches!(
        h.engine.heartbeat(&agent("nobody")).await,
        Err(DialerError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_agent_leg_never_answering_times_out() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    h.engine.login(login_request("1001", campaign)).await?;

    let report = h.engine.sweep_at(Utc::now() + Duration::seconds(90)).await?;
    assert_eq!(report.connecting_expired, 1);
    assert_eq!(
        h.engine.session(&agent("1001")).expect("session").state,
        SessionState::Error
    );

    // The late answer of the leg is ignored
    h.pump().await;
    assert_eq!(
        h.engine.session(&agent("1001")).expect("session").state,
        SessionState::Error
    );
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_wrapup_timeout_returns_agent_to_ready() -> Result<()> {
    let mut h = Harness::new().await;
    let (_, channel) = agent_on_call(&mut h, |c| c.wrapup_timeout_secs = 60).await;
    h.hangup(&channel, HangupCause::Normal).await;
    assert_eq!(h.engine.session(&agent("1001")).expect("session").state, SessionState::Wrapup);

    let early = h.engine.sweep_at(Utc::now() + Duration::seconds(30)).await?;
    assert_eq!(early.wrapups_completed, 0);

    let report = h.engine.sweep_at(Utc::now() + Duration::seconds(90)).await?;
    assert_eq!(report.wrapups_completed, 1);

    let session = h.engine.session(&agent("1001")).expect("session");
    assert_eq!(session.state, SessionState::Ready);
    assert!(session.available);
    assert!(session.wrapup_until.is_none());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_wrapup_timeout_files_automatic_disposition() -> Result<()> {
    let mut h = Harness::new().await;
    let (_, channel) = agent_on_call(&mut h, |c| {
        c.auto_wrapup_disposition = Some("NI".to_string());
    })
    .await;
    let attempt = h.engine.calls().get(&channel).expect("tracked");
    h.hangup(&channel, HangupCause::Normal).await;

    h.engine.sweep_at(Utc::now() + Duration::seconds(90)).await?;

    let record = h.db().get_call_record(attempt.call_id).await?.expect("record");
    assert_eq!(record.disposition.as_deref(), Some("NI"));
    let lead = h.db().get_lead(attempt.lead_id).await?.expect("lead");
    assert_eq!(lead.status, LeadStatus::NotInterested);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_lost_call_is_settled() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    let leads = h.leads(campaign, 1).await;
    h.ready_agent("1001", campaign).await;
    assert_eq!(h.tick().await, 1);
    let channel = h.live_customer_channels().remove(0);
    let call_id = h.engine.calls().get(&channel).expect("tracked").call_id;

    // No event ever arrives for the customer channel; keep the agent alive
    let later = Utc::now() + Duration::seconds(200);
    h.engine.heartbeat(&agent("1001")).await?;
    let report = h.engine.sweep_at(later).await?;
    assert_eq!(report.lost_calls, 1);
    h.pump().await;

    assert!(!h.gateway.is_live(&channel));
    let record = h.db().get_call_record(call_id).await?.expect("record");
    assert_eq!(record.state, AttemptState::Failed);
    assert_eq!(h.db().get_lead(leads[0]).await?.expect("lead").status, LeadStatus::Failed);
    assert!(!h.engine.hopper().contains(campaign, leads[0]));
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_bridged_call_settled_when_hangup_event_is_lost() -> Result<()> {
    let mut h = Harness::new().await;
    let (campaign, channel) = agent_on_call(&mut h, |c| {
        c.dial_method = DialMethod::Progressive;
        c.max_concurrent_calls = 1;
    })
    .await;
    h.leads(campaign, 1).await;
    let call_id = h.engine.calls().get(&channel).expect("tracked").call_id;

    // The customer leaves but the destroyed event never reaches the engine
    assert!(h.gateway.remote_hangup(&channel, HangupCause::Normal));
    while h.events.try_recv().is_ok() {}
    assert_eq!(h.attempt_state(&channel), Some(AttemptState::Bridged));

    let report = h.engine.sweep_at(Utc::now() + Duration::hours(5)).await?;
    assert_eq!(report.heartbeat_expired, 1);
    h.pump().await;

    assert_eq!(h.engine.calls().in_flight(campaign), 0);
    let record = h.db().get_call_record(call_id).await?.expect("record");
    assert_eq!(record.state, AttemptState::Completed);
    assert_eq!(record.outcome, Some(CallOutcome::Answered));
    assert_eq!(record.hangup_cause.as_deref(), Some("session closed"));

    // The line is free again
    h.ready_agent("2001", campaign).await;
    assert_eq!(h.tick().await, 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_reaper_settles_call_of_vanished_session() -> Result<()> {
    let mut h = Harness::new().await;
    let (campaign, channel) = agent_on_call(&mut h, |_| {}).await;
    let call_id = h.engine.calls().get(&channel).expect("tracked").call_id;

    // Session dropped without any teardown of its call
    h.engine
        .sessions()
        .close(&agent("1001"), SessionState::Error, "lost", Utc::now())
        .expect("closed");

    let report = h.engine.sweep_at(Utc::now() + Duration::seconds(30)).await?;
    assert_eq!(report.orphaned_calls, 1);
    h.pump().await;

    assert!(!h.gateway.is_live(&channel));
    assert_eq!(h.engine.calls().in_flight(campaign), 0);
    let record = h.db().get_call_record(call_id).await?.expect("record");
    assert_eq!(record.state, AttemptState::Completed);

    let again = h.engine.sweep_at(Utc::now() + Duration::seconds(40)).await?;
    assert_eq!(again.orphaned_calls, 0);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_reset_during_call_tears_everything_down() -> Result<()> {
    let mut h = Harness::new().await;
    let (campaign, channel) = agent_on_call(&mut h, |_| {}).await;
    let before = h.engine.session(&agent("1001")).expect("session");
    let leg = before.agent_channel.clone().expect("agent leg");
    let bridge = before.bridge_id.clone().expect("bridge");

    let closed = AgentApi::new(h.engine.clone()).reset(&agent("1001")).await?;
    assert_eq!(closed.state, SessionState::Offline);
    assert_eq!(closed.end_reason.as_deref(), Some("reset"));
    h.pump().await;

    assert!(!h.gateway.is_live(&channel));
    assert!(!h.gateway.is_live(&leg));
    assert!(h.gateway.commands().contains(&GatewayCommand::DestroyBridge(bridge)));
    assert_eq!(h.engine.calls().in_flight(campaign), 0);

    assert!(matches!(
        h.engine.reset_session(&agent("1001")).await,
        Err(DialerError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_sweep_finishes_when_recycling_fails() -> Result<()> {
    let mut config = EngineConfig::for_testing();
    config.recycle.rules = vec![RecycleRule {
        source_status: LeadStatus::Busy,
        target_status: LeadStatus::New,
        after_secs: 60,
        max_attempts: 5,
    }];
    let mut h = Harness::with_config(config).await;
    let campaign = h.campaign(|_| {}).await;
    h.leads(campaign, 1).await;
    h.ready_agent("1001", campaign).await;
    assert_eq!(h.tick().await, 1);
    let channel = h.live_customer_channels().remove(0);
    h.hangup(&channel, HangupCause::Busy).await;
    assert_eq!(h.attempt_state(&channel), Some(AttemptState::Completed));

    // Every store query fails from here on
    h.db().pool().close().await;

    let report = h.engine.sweep_at(Utc::now() + Duration::seconds(120)).await?;
    assert_eq!(report.leads_recycled, 0);
    assert_eq!(report.attempts_purged, 1);
    assert_eq!(h.attempt_state(&channel), None);
    Ok(())
}
