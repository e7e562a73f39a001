//! Health endpoints.
//!
//! Open to every caller; the allowed-network check applies only to the image
//! endpoints.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

/// Body of `GET /healthz`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok`, or `draining` once the job queue is closed.
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,

    /// Whether pull and prune requests are still being queued.
    pub accepting_jobs: bool,

    /// Whether any caller can pass the network check.
    pub caller_network_configured: bool,

    /// Cron expression of the recurring prune, if one is running.
    pub prune_schedule: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/livez", get(livez))
}

/// Report controller state. Answers 503 while shutting down so that load
/// balancers stop routing image requests here.
async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let accepting_jobs = !state.jobs().is_closed();
    let (status, label) = if accepting_jobs {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    };

    let body = HealthResponse {
        status: label.to_string(),
        service: "image-controller".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        accepting_jobs,
        caller_network_configured: state.allowed_network().network().is_some(),
        prune_schedule: state.prune_schedule().map(str::to_string),
    };

    (status, Json(body))
}

async fn livez() -> StatusCode {
    StatusCode::OK
}
