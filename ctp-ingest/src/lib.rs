//! ctp-ingest library interface
//!
//! Resumable ingestion of hourly scan buckets from a remote object store
//! into a local inbox, with a durable ledger of what has been fetched.

pub mod api;
pub mod clock;
pub mod error;
pub mod fetch_pool;
pub mod ledger;
pub mod remote;
pub mod retry;
pub mod s3;
pub mod scheduler;

pub use crate::error::{IngestError, Result};
pub use crate::fetch_pool::{BatchReport, FetchOutcome, FetchPool, FetchSettings};
pub use crate::ledger::{Ledger, LedgerLoad, SharedLedger};
pub use crate::remote::{RemoteError, RemoteObjectKey, RemoteStore};
pub use crate::retry::{RetryDecision, RetryEvent, RetryPolicy, RetryState};
pub use crate::scheduler::{IngestScheduler, Phase, SchedulerStatus, StepOutcome};

use axum::Router;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Latest scheduler status
    pub status: watch::Receiver<SchedulerStatus>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(status: watch::Receiver<SchedulerStatus>) -> Self {
        Self {
            status,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new().merge(api::status_routes()).with_state(state)
}
