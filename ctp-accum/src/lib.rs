//! ctp-accum library interface
//!
//! Sliding-window cloud-top persistence: each new scan in the inbox is
//! cropped, calibrated and thresholded into a binary mask, and the window
//! keeps a running per-pixel count over the most recent masks.

pub mod api;
pub mod calibration;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod grid;
pub mod inbox;
pub mod preprocess;
pub mod service;
pub mod snapshot;
pub mod window;

pub use crate::decoder::{CommandDecoder, DecodeError, ScanDecoder};
pub use crate::error::{AccumError, PreprocessError, Result};
pub use crate::frame::{CalibratedFrame, FrameMeta, ScanHeader, ThresholdMask};
pub use crate::grid::{GridAlignmentError, PixelWindow, ReferenceGrid};
pub use crate::preprocess::{PreprocessSettings, Preprocessor};
pub use crate::service::{AccumulationService, FrameDisposition, ServiceStatus};
pub use crate::window::{AccumulationWindow, InsertOutcome, SharedWindow, WindowError, WindowSnapshot};

use axum::Router;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub window: SharedWindow,
    pub status: watch::Receiver<ServiceStatus>,
    pub threshold_celsius: f32,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(window: SharedWindow, status: watch::Receiver<ServiceStatus>, threshold_celsius: f32) -> Self {
        Self {
            window,
            status,
            threshold_celsius,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new().merge(api::snapshot_routes()).with_state(state)
}
