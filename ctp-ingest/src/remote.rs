//! Remote object store seam
//!
//! The scheduler and fetch pool only see [`RemoteStore`]; the production
//! implementation is [`crate::s3::S3HttpStore`].

use async_trait::async_trait;
use ctp_common::{ScanName, TimeBucket};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Remote store errors
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Connection, DNS, TLS or timeout failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server answered with a non-success status
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },

    /// Response body could not be understood
    #[error("Parse error: {0}")]
    Parse(String),

    /// Writing the downloaded body failed locally
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Failures on our side rather than the network's
    pub fn is_local(&self) -> bool {
        matches!(self, RemoteError::Io(_))
    }
}

/// Full object key as returned by a listing, e.g.
/// `ABI-L1b-RadF/2024/330/12/OR_ABI-L1b-RadF-M6C13_G16_s2024330120021...nc`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteObjectKey(String);

impl RemoteObjectKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Parsed scan name fields
    pub fn scan(&self) -> ctp_common::Result<ScanName> {
        ScanName::parse(self.file_name())
    }
}

impl fmt::Display for RemoteObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RemoteObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Time-partitioned remote object store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Cheap reachability check
    async fn probe(&self) -> Result<(), RemoteError>;

    /// All object keys currently published under `bucket`
    async fn list(&self, bucket: &TimeBucket) -> Result<Vec<RemoteObjectKey>, RemoteError>;

    /// Download `key` to `dest`, returning bytes written
    ///
    /// `dest` may hold a partial body when this fails; callers discard it.
    async fn fetch(&self, key: &RemoteObjectKey, dest: &Path) -> Result<u64, RemoteError>;
}
