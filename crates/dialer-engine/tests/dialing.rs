//! Scheduler behavior against the loopback telephony server

mod common;

use std::collections::HashSet;

use anyhow::Result;
use autodialer_engine::gateway::loopback::FailOp;
use autodialer_engine::hopper::EntryState;
use autodialer_engine::prelude::*;
use chrono::Utc;
use common::Harness;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn test_predictive_ratio_sets_dial_count() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|c| c.dial_ratio = 2.0).await;
    h.leads(campaign, 10).await;
    for agent in ["1001", "1002", "1003"] {
        h.ready_agent(agent, campaign).await;
    }

    let placed = h.tick().await;
    assert_eq!(placed, 6, "3 agents at ratio 2.0 should place 6 calls");
    assert_eq!(h.live_customer_channels().len(), 6);

    // Calls in flight count against the target
    let placed = h.tick().await;
    assert_eq!(placed, 0);
    assert_eq!(h.engine.calls().in_flight(campaign), 6);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_line_limit_caps_dialing() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h
        .campaign(|c| {
            c.dial_ratio = 3.0;
            c.max_lines = 4;
        })
        .await;
    h.leads(campaign, 20).await;
    h.ready_agent("1001", campaign).await;
    h.ready_agent("1002", campaign).await;

    assert_eq!(h.tick().await, 4);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_no_ready_agents_no_dialing() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    h.leads(campaign, 5).await;

    assert_eq!(h.tick().await, 0);
    assert!(h.gateway.customer_channels().is_empty());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_each_lead_dialed_once() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|c| c.dial_ratio = 3.0).await;
    h.leads(campaign, 4).await;
    h.ready_agent("1001", campaign).await;
    h.ready_agent("1002", campaign).await;

    // Six wanted, only four leads exist
    assert_eq!(h.tick().await, 4);
    assert_eq!(h.tick().await, 0);

    let channels = h.gateway.customer_channels();
    let leads: HashSet<LeadId> = channels
        .iter()
        .filter_map(|c| h.engine.calls().get(c).map(|a| a.lead_id))
        .collect();
    assert_eq!(leads.len(), channels.len(), "a lead was dialed twice");
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_dnc_number_never_dialed() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|c| c.dial_ratio = 3.0).await;
    let leads = h.leads(campaign, 3).await;
    let blocked = h.db().get_lead(leads[0]).await?.expect("lead").phone_number;
    h.db().add_dnc_number(&blocked, Some("customer request"), Utc::now()).await?;
    h.ready_agent("1001", campaign).await;

    assert_eq!(h.tick().await, 2);
    for channel in h.gateway.customer_channels() {
        let attempt = h.engine.calls().get(&channel).expect("tracked attempt");
        assert_ne!(attempt.phone_number, blocked);
    }

    let lead = h.db().get_lead(leads[0]).await?.expect("lead");
    assert_eq!(lead.status, LeadStatus::Dnc);
    assert_eq!(lead.call_count, 0);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_failed_originate_returns_lead_to_hopper() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    let leads = h.leads(campaign, 1).await;
    h.ready_agent("1001", campaign).await;

    h.gateway.fail_next(FailOp::Originate);
    assert_eq!(h.tick().await, 0);

    let lead = h.db().get_lead(leads[0]).await?.expect("lead");
    assert_eq!(lead.status, LeadStatus::Failed);
    assert_eq!(lead.call_count, 1);
    assert_eq!(
        h.engine.hopper().state_of(campaign, leads[0]),
        Some(EntryState::Available)
    );
    assert_eq!(h.engine.calls().in_flight(campaign), 0);

    // The next tick retries it
    assert_eq!(h.tick().await, 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_progressive_dials_one_per_agent() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h
        .campaign(|c| {
            c.dial_method = DialMethod::Progressive;
            c.dial_ratio = 3.0;
        })
        .await;
    h.leads(campaign, 10).await;
    h.ready_agent("1001", campaign).await;
    h.ready_agent("1002", campaign).await;

    assert_eq!(h.tick().await, 2);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_paused_campaign_is_skipped() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    h.leads(campaign, 5).await;
    h.ready_agent("1001", campaign).await;

    h.engine.pause_campaign(campaign, Some("lunch")).await?;
    assert_eq!(h.tick().await, 0);

    h.engine.resume_campaign(campaign).await?;
    assert_eq!(h.tick().await, 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_unknown_server_pauses_campaign() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|c| c.server_id = Some("nowhere".to_string())).await;
    h.leads(campaign, 5).await;

    assert_eq!(h.tick().await, 0);

    let stored = h.db().get_campaign(campaign).await?.expect("campaign");
    assert_eq!(stored.status, CampaignStatus::Paused);
    let health = h.engine.campaign_health(campaign).expect("health");
    assert!(!health.healthy);
    assert!(health.reason.unwrap_or_default().contains("nowhere"));

    let alerts: Vec<_> = h
        .drain_notifications()
        .into_iter()
        .filter(|n| matches!(n, DialerNotification::CampaignHealthChanged { healthy: false, .. }))
        .collect();
    assert_eq!(alerts.len(), 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_abandons_lower_dial_ratio() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|c| c.dial_ratio = 2.0).await;
    h.leads(campaign, 10).await;

    // No agents when the customers answer: both abandon
    let now = Utc::now();
    h.engine.stats_registry().record_answer(campaign, true, now);
    h.engine.stats_registry().record_answer(campaign, true, now);

    h.ready_agent("1001", campaign).await;
    h.tick().await;

    let stored = h.db().get_campaign(campaign).await?.expect("campaign");
    assert!(stored.dial_ratio < 2.0, "ratio {} was not lowered", stored.dial_ratio);
    assert!(stored.dial_ratio >= stored.dial_ratio_min);
    Ok(())
}
