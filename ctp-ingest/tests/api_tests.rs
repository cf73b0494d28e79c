//! Status endpoint tests

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use ctp_ingest::clock::ManualClock;
use ctp_ingest::{build_router, AppState, IngestScheduler, Ledger};
use helpers::{test_config, today, MemoryStore};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn scheduler(dir: &TempDir) -> IngestScheduler {
    let config = test_config(dir.path());
    IngestScheduler::new(
        &config,
        Arc::new(MemoryStore::new()),
        Arc::new(Mutex::new(Ledger::empty(config.ledger_path()))),
        Arc::new(ManualClock::new(today())),
        CancellationToken::new(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_status_reports_current_bucket() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler(&dir).await;
    let app = build_router(AppState::new(scheduler.subscribe()));

    let (status, body) = get_json(app, "/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current_bucket"], "2024/330/12");
    assert_eq!(body["expected_per_bucket"], 6);
    assert_eq!(body["phase"], "awaiting_listing");
}

#[tokio::test]
async fn test_health_is_degraded_until_remote_answers() {
    let dir = TempDir::new().unwrap();
    let mut scheduler = scheduler(&dir).await;
    let app = build_router(AppState::new(scheduler.subscribe()));

    let (_, body) = get_json(app.clone(), "/health").await;
    assert_eq!(body["module"], "ctp-ingest");
    assert_eq!(body["status"], "degraded");

    assert!(scheduler.wait_for_remote().await);
    let (status, body) = get_json(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
