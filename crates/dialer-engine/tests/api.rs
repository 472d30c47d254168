//! HTTP agent API, driven through the router without a socket

mod common;

use anyhow::Result;
use autodialer_engine::api::router;
use autodialer_engine::prelude::*;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use common::Harness;
use serde_json::{json, Value};
use serial_test::serial;
use tower::ServiceExt;

fn app(h: &Harness) -> Router {
    router(AgentApi::new(h.engine.clone()))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> Result<(StatusCode, Value)> {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))?,
        None => builder.body(Body::empty())?,
    };

    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, value))
}

#[tokio::test]
#[serial]
async fn test_login_and_session_lookup() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    let app = app(&h);

    let (status, body) = send(
        &app,
        Method::POST,
        "/agents/1001/login",
        Some(json!({ "campaign_id": campaign, "endpoint": "PJSIP/1001" })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["state"], "connecting");

    h.pump().await;
    let (status, body) = send(&app, Method::GET, "/agents/1001", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "ready");
    assert_eq!(body["agent_id"], "1001");

    let (status, body) = send(
        &app,
        Method::POST,
        "/agents/1001/login",
        Some(json!({ "campaign_id": campaign, "endpoint": "PJSIP/1001" })),
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap_or_default().contains("1001"));
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_unknown_agent_is_not_found() -> Result<()> {
    let h = Harness::new().await;
    let app = app(&h);

    let (status, body) = send(&app, Method::GET, "/agents/ghost", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, _) = send(&app, Method::POST, "/agents/ghost/heartbeat", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_availability_and_logout() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    h.ready_agent("1001", campaign).await;
    let app = app(&h);

    let (status, body) = send(
        &app,
        Method::POST,
        "/agents/1001/availability",
        Some(json!({ "available": false })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available"], false);

    let (status, body) = send(&app, Method::POST, "/agents/1001/heartbeat", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (status, body) = send(&app, Method::POST, "/agents/1001/logout", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "offline");
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_disposition_errors_map_to_status() -> Result<()> {
    let h = Harness::new().await;
    let app = app(&h);

    let (status, _) = send(
        &app,
        Method::POST,
        "/dispositions",
        Some(json!({ "call_id": CallId::new(), "disposition": "NI" })),
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        Method::POST,
        "/dispositions",
        Some(json!({ "call_id": CallId::new(), "disposition": "NOPE" })),
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_disposition_over_http() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    h.leads(campaign, 1).await;
    h.ready_agent("1001", campaign).await;
    h.tick().await;
    let channel = h.live_customer_channels().remove(0);
    let call_id = h.engine.calls().get(&channel).expect("tracked").call_id;
    h.answer(&channel).await;
    h.hangup(&channel, HangupCause::Normal).await;
    let app = app(&h);

    let (status, body) = send(
        &app,
        Method::POST,
        "/dispositions",
        Some(json!({ "call_id": call_id, "disposition": "SALE", "notes": "upgrade" })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lead_status"], "sale");
    assert_eq!(body["session"]["state"], "ready");

    let (status, _) = send(
        &app,
        Method::POST,
        "/dispositions",
        Some(json!({ "call_id": call_id, "disposition": "NI" })),
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_campaign_pause_resume_and_stats() -> Result<()> {
    let h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    let app = app(&h);

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/campaigns/{}/pause", campaign),
        Some(json!({ "reason": "compliance review" })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let stored = h.db().get_campaign(campaign).await?.expect("campaign");
    assert_eq!(stored.status, CampaignStatus::Paused);
    assert_eq!(stored.pause_reason.as_deref(), Some("compliance review"));

    let (status, _) = send(&app, Method::POST, &format!("/campaigns/{}/resume", campaign), None).await?;
    assert_eq!(status, StatusCode::OK);
    let stored = h.db().get_campaign(campaign).await?.expect("campaign");
    assert_eq!(stored.status, CampaignStatus::Active);

    let (status, _) = send(&app, Method::POST, "/campaigns/999/pause", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, Method::GET, "/stats", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active_sessions"], 0);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_reset_route() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h.campaign(|_| {}).await;
    h.ready_agent("1001", campaign).await;
    let app = app(&h);

    let (status, body) = send(&app, Method::POST, "/agents/1001/reset", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "offline");
    assert_eq!(body["end_reason"], "reset");

    let (status, _) = send(&app, Method::POST, "/agents/1001/reset", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}
