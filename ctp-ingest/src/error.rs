//! Error types for ctp-ingest

use thiserror::Error;

/// Result type for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Ingestion errors
///
/// Per-object failures never surface here; they are reported as
/// [`crate::fetch_pool::FetchOutcome`] values. These are the failures that
/// stop a component from making progress at all.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Ledger could not be read or persisted
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Local filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// ctp-common error
    #[error("Common error: {0}")]
    Common(#[from] ctp_common::Error),
}
