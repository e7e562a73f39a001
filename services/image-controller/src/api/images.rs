//! Image lifecycle endpoints.
//!
//! Both endpoints only validate and enqueue. The work itself runs in the
//! background and its outcome is visible only in logs and in the image store.

use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::error::ApiError;
use crate::config::DEFAULT_PRUNE_DAYS;
use crate::jobs::Job;
use crate::reference::normalize_image_ref;
use crate::state::AppState;

/// Create image routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/pull-image", post(pull_image))
        .route("/prune-images", post(prune_images))
}

/// Response for an accepted pull.
#[derive(Debug, Serialize)]
pub struct PullAccepted {
    pub status: &'static str,
}

/// Response for an accepted prune.
#[derive(Debug, Serialize)]
pub struct PruneAccepted {
    pub status: &'static str,
    pub days: u32,
}

/// Schedule a pull of `image` into the host image store.
async fn pull_image(
    State(state): State<AppState>,
    ConnectInfo(caller): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Result<Json<PullAccepted>, ApiError> {
    authorize(&state, caller)?;

    let body = parse_body(&body)?;
    let image = body
        .get("image")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("invalid_request", "No image provided"))?;

    let image = normalize_image_ref(image);
    let job = Job::Pull {
        image: image.clone(),
    };
    enqueue(&state, job)?;

    info!(caller = %caller, image = %image, "Pull accepted");
    Ok(Json(PullAccepted { status: "ok" }))
}

/// Schedule a prune of images older than `days` (default 14).
async fn prune_images(
    State(state): State<AppState>,
    ConnectInfo(caller): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Result<Json<PruneAccepted>, ApiError> {
    authorize(&state, caller)?;

    let body = parse_body(&body)?;
    let days = match body.get("days") {
        None | Some(Value::Null) => DEFAULT_PRUNE_DAYS,
        Some(value) => value
            .as_u64()
            .and_then(|d| u32::try_from(d).ok())
            .ok_or_else(|| {
                ApiError::bad_request("invalid_request", "days must be a non-negative integer")
            })?,
    };

    enqueue(&state, Job::Prune { days })?;

    info!(caller = %caller, days = days, "Prune accepted");
    Ok(Json(PruneAccepted { status: "ok", days }))
}

fn authorize(state: &AppState, caller: SocketAddr) -> Result<(), ApiError> {
    if state.allowed_network().permits(caller.ip()) {
        return Ok(());
    }

    warn!(
        caller = %caller,
        allowed_network = %state.allowed_network(),
        "Rejected caller outside allowed network"
    );
    Err(ApiError::forbidden("forbidden", "Forbidden"))
}

/// Parse a request body as a JSON object. An empty body is an empty object.
fn parse_body(body: &[u8]) -> Result<Map<String, Value>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ApiError::bad_request(
            "invalid_request",
            "request body must be a JSON object",
        )),
        Err(e) => Err(ApiError::bad_request(
            "invalid_json",
            format!("invalid JSON body: {e}"),
        )),
    }
}

fn enqueue(state: &AppState, job: Job) -> Result<(), ApiError> {
    state.jobs().submit(job).map_err(|e| {
        warn!(error = %e, "Rejecting request, job queue closed");
        ApiError::service_unavailable("shutting_down", "service is shutting down")
    })
}
