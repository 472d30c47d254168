//! HTTP surface for agent desktops.
//!
//! POST /agents/:id/login, /logout, /reset, /heartbeat, /availability,
//! GET /agents/:id, POST /dispositions, GET /stats,
//! POST /campaigns/:id/pause, /resume.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::agent::AgentApi;
use crate::agent::LoginRequest;
use crate::disposition::DispositionRequest;
use crate::error::DialerError;
use crate::types::{AgentId, CampaignId};

/// Body of POST /agents/:id/login
#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub campaign_id: CampaignId,
    pub endpoint: String,
    #[serde(default)]
    pub server_id: Option<String>,
}

/// Body of POST /agents/:id/availability
#[derive(Debug, Deserialize)]
pub struct AvailabilityBody {
    pub available: bool,
}

/// Body of POST /campaigns/:id/pause
#[derive(Debug, Default, Deserialize)]
pub struct PauseBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Build the router. The caller binds and serves it.
pub fn router(api: AgentApi) -> Router {
    Router::new()
        .route("/agents/:id", get(get_session))
        .route("/agents/:id/login", post(login))
        .route("/agents/:id/logout", post(logout))
        .route("/agents/:id/reset", post(reset))
        .route("/agents/:id/heartbeat", post(heartbeat))
        .route("/agents/:id/availability", post(set_availability))
        .route("/dispositions", post(submit_disposition))
        .route("/stats", get(get_stats))
        .route("/campaigns/:id/pause", post(pause_campaign))
        .route("/campaigns/:id/resume", post(resume_campaign))
        .with_state(api)
}

fn error_response(err: DialerError) -> Response {
    let status = match &err {
        DialerError::NotFound(_) => StatusCode::NOT_FOUND,
        DialerError::AlreadyExists(_) | DialerError::InvalidState(_) | DialerError::Agent(_) => {
            StatusCode::CONFLICT
        }
        DialerError::Disposition(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DialerError::Gateway(_) => StatusCode::BAD_GATEWAY,
        DialerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        DialerError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
        DialerError::Database(_)
        | DialerError::Hopper(_)
        | DialerError::Matching(_)
        | DialerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!("API request failed: {}", err);
    } else {
        debug!("API request refused: {}", err);
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

/// GET /agents/:id
async fn get_session(State(api): State<AgentApi>, Path(id): Path<String>) -> Response {
    let agent_id = AgentId::new(id);
    match api.session(&agent_id) {
        Some(session) => Json(session).into_response(),
        None => error_response(DialerError::not_found(format!("no session for {}", agent_id))),
    }
}

/// POST /agents/:id/login
async fn login(
    State(api): State<AgentApi>,
    Path(id): Path<String>,
    Json(body): Json<LoginBody>,
) -> Response {
    let request = LoginRequest {
        agent_id: AgentId::new(id),
        campaign_id: body.campaign_id,
        endpoint: body.endpoint,
        server_id: body.server_id,
    };
    match api.login(request).await {
        Ok(session) => (StatusCode::CREATED, Json(session)).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /agents/:id/logout
async fn logout(State(api): State<AgentApi>, Path(id): Path<String>) -> Response {
    match api.logout(&AgentId::new(id)).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /agents/:id/reset
async fn reset(State(api): State<AgentApi>, Path(id): Path<String>) -> Response {
    match api.reset(&AgentId::new(id)).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /agents/:id/heartbeat
async fn heartbeat(State(api): State<AgentApi>, Path(id): Path<String>) -> Response {
    match api.heartbeat(&AgentId::new(id)).await {
        Ok(()) => Json(OkResponse { ok: true }).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /agents/:id/availability
async fn set_availability(
    State(api): State<AgentApi>,
    Path(id): Path<String>,
    Json(body): Json<AvailabilityBody>,
) -> Response {
    match api.set_available(&AgentId::new(id), body.available).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /dispositions
async fn submit_disposition(
    State(api): State<AgentApi>,
    Json(body): Json<DispositionRequest>,
) -> Response {
    match api.submit_disposition(body).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /stats
async fn get_stats(State(api): State<AgentApi>) -> Response {
    Json(api.stats()).into_response()
}

/// POST /campaigns/:id/pause
async fn pause_campaign(
    State(api): State<AgentApi>,
    Path(id): Path<CampaignId>,
    body: Option<Json<PauseBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    match api.pause_campaign(id, body.reason.as_deref()).await {
        Ok(()) => Json(OkResponse { ok: true }).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /campaigns/:id/resume
async fn resume_campaign(State(api): State<AgentApi>, Path(id): Path<CampaignId>) -> Response {
    match api.resume_campaign(id).await {
        Ok(()) => Json(OkResponse { ok: true }).into_response(),
        Err(e) => error_response(e),
    }
}
