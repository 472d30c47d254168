//! Agent dispositions and their effect on leads and sessions

mod common;

use anyhow::Result;
use autodialer_engine::prelude::*;
use chrono::{Duration, Utc};
use common::Harness;
use serial_test::serial;

/// A finished call waiting in wrap-up, returning its call and lead
async fn call_in_wrapup(h: &mut Harness) -> (CampaignId, CallId, LeadId) {
    let (campaign, call_id, lead_id, channel) = call_on_air(h).await;
    h.hangup(&channel, HangupCause::Normal).await;
    assert_eq!(
        h.engine.session(&AgentId::from("1001")).expect("session").state,
        SessionState::Wrapup
    );
    (campaign, call_id, lead_id)
}

async fn call_on_air(h: &mut Harness) -> (CampaignId, CallId, LeadId, ChannelId) {
    let campaign = h.campaign(|_| {}).await;
    h.leads(campaign, 1).await;
    h.ready_agent("1001", campaign).await;
    assert_eq!(h.tick().await, 1);

    let channel = h.live_customer_channels().remove(0);
    let attempt = h.engine.calls().get(&channel).expect("tracked");
    h.answer(&channel).await;
    (campaign, attempt.call_id, attempt.lead_id, channel)
}

fn request(call_id: CallId, code: &str) -> DispositionRequest {
    DispositionRequest {
        call_id,
        disposition: code.to_string(),
        notes: None,
        callback_at: None,
    }
}

#[tokio::test]
#[serial]
async fn test_sale_returns_agent_to_ready() -> Result<()> {
    let mut h = Harness::new().await;
    let (campaign, call_id, lead_id) = call_in_wrapup(&mut h).await;

    let result = h
        .engine
        .submit_disposition(DispositionRequest {
            notes: Some("annual plan".to_string()),
            ..request(call_id, "SALE")
        })
        .await?;
    assert_eq!(result.lead_status, LeadStatus::Sale);

    let session = result.session.expect("session changed");
    assert_eq!(session.state, SessionState::Ready);
    assert!(session.available);

    let record = h.db().get_call_record(call_id).await?.expect("record");
    assert_eq!(record.disposition.as_deref(), Some("SALE"));
    assert_eq!(record.notes.as_deref(), Some("annual plan"));
    assert_eq!(h.db().get_lead(lead_id).await?.expect("lead").status, LeadStatus::Sale);
    assert_eq!(h.engine.stats_registry().campaign(campaign, Utc::now()).sales, 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_manual_availability_disposition_pauses_agent() -> Result<()> {
    let mut h = Harness::new().await;
    h.db()
        .upsert_disposition(&Disposition {
            auto_available: false,
            ..Disposition::new("FOLLOW", "Follow-up paperwork", LeadStatus::Interested)
        })
        .await?;
    let (campaign, call_id, lead_id) = call_in_wrapup(&mut h).await;

    let result = h.engine.submit_disposition(request(call_id, "FOLLOW")).await?;
    let session = result.session.expect("session changed");
    assert_eq!(session.state, SessionState::Ready);
    assert!(!session.available);
    assert_eq!(
        h.db().get_lead(lead_id).await?.expect("lead").status,
        LeadStatus::Interested
    );

    // Paused agents are not counted
    h.leads(campaign, 2).await;
    assert_eq!(h.tick().await, 0);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_disposition_during_call_ends_it() -> Result<()> {
    let mut h = Harness::new().await;
    let (_, call_id, _, channel) = call_on_air(&mut h).await;

    let result = h.engine.submit_disposition(request(call_id, "NI")).await?;
    assert_eq!(result.lead_status, LeadStatus::NotInterested);
    assert_eq!(result.session.expect("session").state, SessionState::Ready);
    h.pump().await;

    assert!(!h.gateway.is_live(&channel));
    let record = h.db().get_call_record(call_id).await?.expect("record");
    assert_eq!(record.state, AttemptState::Completed);
    assert_eq!(record.outcome, Some(CallOutcome::Answered));

    // The hangup did not push the agent into wrap-up
    assert_eq!(
        h.engine.session(&AgentId::from("1001")).expect("session").state,
        SessionState::Ready
    );
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_dnc_disposition_blocks_number_everywhere() -> Result<()> {
    let mut h = Harness::new().await;
    let (_, call_id, lead_id) = call_in_wrapup(&mut h).await;
    let number = h.db().get_lead(lead_id).await?.expect("lead").phone_number;

    let other_campaign = h.campaign(|_| {}).await;
    let twin = h
        .db()
        .create_lead(&NewLead::new(other_campaign, number.clone()))
        .await?;

    let result = h.engine.submit_disposition(request(call_id, "DNC")).await?;
    assert_eq!(result.lead_status, LeadStatus::Dnc);
    assert!(h.db().is_dnc_number(&number).await?);
    assert_eq!(h.db().get_lead(twin).await?.expect("lead").status, LeadStatus::Dnc);

    h.ready_agent("2001", other_campaign).await;
    assert_eq!(h.tick().await, 0);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_callback_schedules_lead() -> Result<()> {
    let mut h = Harness::new().await;
    let (_, call_id, lead_id) = call_in_wrapup(&mut h).await;
    let at = Utc::now() + Duration::hours(2);

    let result = h
        .engine
        .submit_disposition(DispositionRequest {
            callback_at: Some(at),
            ..request(call_id, "CB")
        })
        .await?;
    assert_eq!(result.lead_status, LeadStatus::Callback);
    assert_eq!(result.callback_at, Some(at));

    let lead = h.db().get_lead(lead_id).await?.expect("lead");
    assert_eq!(lead.status, LeadStatus::Callback);
    assert_eq!(
        lead.callback_at.map(|t| t.timestamp_millis()),
        Some(at.timestamp_millis())
    );
    assert!(!lead.is_dialable(Utc::now()));
    assert!(lead.is_dialable(at));
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_callback_without_time_uses_default_delay() -> Result<()> {
    let mut h = Harness::new().await;
    let (_, call_id, _) = call_in_wrapup(&mut h).await;
    let before = Utc::now();

    let result = h.engine.submit_disposition(request(call_id, "CB")).await?;
    let at = result.callback_at.expect("callback time");
    assert!(at >= before + Duration::seconds(3600));
    assert!(at <= Utc::now() + Duration::seconds(3600));
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_invalid_callback_requests_refused() -> Result<()> {
    let mut h = Harness::new().await;
    let (_, call_id, _) = call_in_wrapup(&mut h).await;

    let past = DispositionRequest {
        callback_at: Some(Utc::now() - Duration::minutes(5)),
        ..request(call_id, "CB")
    };
    assert!(matches!(
        h.engine.submit_disposition(past).await,
        Err(DialerError::Disposition(_))
    ));

    let not_a_callback = DispositionRequest {
        callback_at: Some(Utc::now() + Duration::hours(1)),
        ..request(call_id, "SALE")
    };
    assert!(matches!(
        h.engine.submit_disposition(not_a_callback).await,
        Err(DialerError::Disposition(_))
    ));

    // Nothing was recorded; a valid submission still goes through
    h.engine.submit_disposition(request(call_id, "NI")).await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_second_disposition_refused() -> Result<()> {
    let mut h = Harness::new().await;
    let (_, call_id, lead_id) = call_in_wrapup(&mut h).await;

    h.engine.submit_disposition(request(call_id, "NI")).await?;
    assert!(matches!(
        h.engine.submit_disposition(request(call_id, "SALE")).await,
        Err(DialerError::AlreadyExists(_))
    ));
    assert_eq!(
        h.db().get_lead(lead_id).await?.expect("lead").status,
        LeadStatus::NotInterested
    );
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_unknown_code_and_call() -> Result<()> {
    let mut h = Harness::new().await;
    let (_, call_id, _) = call_in_wrapup(&mut h).await;

    assert!(matches!(
        h.engine.submit_disposition(request(call_id, "NOPE")).await,
        Err(DialerError::Disposition(_))
    ));
    assert!(matches!(
        h.engine.submit_disposition(request(CallId::new(), "NI")).await,
        Err(DialerError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_dnc_disposition_clears_hopper_of_shared_number() -> Result<()> {
    let mut h = Harness::new().await;
    let campaign = h
        .campaign(|c| c.dial_method = DialMethod::Progressive)
        .await;
    let first = h.db().create_lead(&NewLead::new(campaign, "5550999")).await?;
    let second = h.db().create_lead(&NewLead::new(campaign, "5550999")).await?;
    h.ready_agent("1001", campaign).await;
    assert_eq!(h.tick().await, 1);

    let channel = h.live_customer_channels().remove(0);
    let attempt = h.engine.calls().get(&channel).expect("tracked");
    let other = if attempt.lead_id == first { second } else { first };
    assert!(h.engine.hopper().contains(campaign, other));

    h.answer(&channel).await;
    h.hangup(&channel, HangupCause::Normal).await;
    h.engine.submit_disposition(request(attempt.call_id, "DNC")).await?;

    assert_eq!(h.db().get_lead(other).await?.expect("lead").status, LeadStatus::Dnc);
    assert_eq!(h.engine.hopper().state_of(campaign, other), None);
    assert!(!h.engine.hopper().contains(campaign, attempt.lead_id));
    Ok(())
}
