//! HTTP endpoints: health and the current persistence snapshot

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::service::ServiceStatus;
use crate::snapshot::SnapshotDocument;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub window_frames: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = Utc::now()
        .signed_duration_since(state.startup_time)
        .num_seconds()
        .max(0) as u64;
    let status: ServiceStatus = state.status.borrow().clone();

    Json(HealthResponse {
        status: "ok".to_string(),
        module: "ctp-accum".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        window_frames: status.window_frames,
        last_error: status.last_error,
    })
}

/// GET /snapshot
///
/// Accumulated hours below threshold plus metadata of the latest frame.
pub async fn current_snapshot(State(state): State<AppState>) -> Result<Json<SnapshotDocument>, SnapshotError> {
    let snapshot = state.window.read().await.snapshot();
    snapshot
        .map(|s| Json(SnapshotDocument::new(s, state.threshold_celsius)))
        .ok_or(SnapshotError::Empty)
}

/// Snapshot API errors
#[derive(Debug)]
pub enum SnapshotError {
    /// No frame accumulated yet
    Empty,
}

impl IntoResponse for SnapshotError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            SnapshotError::Empty => (StatusCode::NOT_FOUND, "No frames accumulated yet".to_string()),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn snapshot_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/snapshot", get(current_snapshot))
}
