//! The assembled server: background loops driving a loopback telephony server

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use autodialer_engine::prelude::*;
use serial_test::serial;

async fn wait_for<F>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("timed out waiting for {}", what)
}

#[tokio::test]
#[serial]
async fn test_server_dials_and_bridges() -> Result<()> {
    let mut config = EngineConfig::for_testing();
    config.scheduler.tick_interval_ms = 20;
    config.matcher.event_workers = 2;

    let gateway = Arc::new(LoopbackGateway::new("loopback"));
    let mut server = DialerServerBuilder::new()
        .with_config(config)
        .with_in_memory_database()
        .with_gateway(gateway.clone())
        .build()
        .await?;
    let mut notifications = server.notifier().subscribe();
    server.start().await?;

    let db = server.engine().database();
    let campaign = db.create_campaign(&Campaign::new("server test")).await?;
    db.create_lead(&NewLead::new(campaign, "5550100")).await?;

    let agent = AgentId::from("1001");
    server
        .api()
        .login(LoginRequest {
            agent_id: agent.clone(),
            campaign_id: campaign,
            endpoint: "PJSIP/1001".to_string(),
            server_id: None,
        })
        .await?;

    let api = server.api().clone();
    wait_for("agent ready", || {
        api.session(&agent).map(|s| s.state) == Some(SessionState::Ready)
    })
    .await?;
    wait_for("customer dialed", || !gateway.customer_channels().is_empty()).await?;

    let channel = gateway.customer_channels().remove(0);
    assert!(gateway.answer(&channel));
    wait_for("call bridged", || {
        api.session(&agent).map(|s| s.state) == Some(SessionState::OnCall)
    })
    .await?;

    let mut connected = false;
    while let Ok(envelope) = notifications.try_recv() {
        if matches!(envelope.notification, DialerNotification::CallConnected { .. }) {
            assert_eq!(envelope.audience, Audience::Agent(agent.clone()));
            connected = true;
        }
    }
    assert!(connected, "agent was not told about the call");

    tokio_test::assert_ok!(server.stop().await);
    assert!(gateway.is_live(&channel), "stopping must not hang up calls in flight");
    Ok(())
}
