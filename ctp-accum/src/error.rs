//! Error types for ctp-accum

use crate::decoder::DecodeError;
use crate::grid::GridAlignmentError;
use crate::window::WindowError;
use thiserror::Error;

/// Result type for accumulation operations
pub type Result<T> = std::result::Result<T, AccumError>;

/// Service-level accumulation errors
///
/// Per-frame problems are [`crate::preprocess::PreprocessError`] and only
/// drop the frame. What reaches this type stops the service.
#[derive(Debug, Error)]
pub enum AccumError {
    /// Window invariant violated (mask shapes differ)
    #[error("Window error: {0}")]
    Window(#[from] WindowError),

    /// Inbox watcher or poller failed
    #[error("Inbox error: {0}")]
    Inbox(String),

    /// Local filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a single frame is discarded
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("file {path} is not usable: {reason}")]
    InvalidFile { path: String, reason: String },

    #[error("band {band} is not thermal (minimum {min})")]
    NonThermalBand { band: u8, min: u8 },

    #[error("grid alignment failed: {0}")]
    GridAlignment(#[from] GridAlignmentError),

    #[error("decoder failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("calibration failed: {0}")]
    Calibration(String),
}
