//! Bounded-concurrency download of one bucket's objects
//!
//! Each key goes through: band filter → ledger check → stream to
//! `temp_dir/<name>.part` → size verification → move into the inbox →
//! ledger record. Failures are isolated per key and reported in the
//! [`BatchReport`]; nothing here retries. Retrying is the scheduler's job,
//! by listing the bucket again.

use crate::ledger::SharedLedger;
use crate::remote::{RemoteObjectKey, RemoteStore};
use ctp_common::config::Config;
use ctp_common::TimeBucket;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Suffix of in-progress files: downloads in the temp directory and
/// cross-filesystem copies into the inbox
pub const PARTIAL_SUFFIX: &str = ".part";

/// Per-key result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FetchOutcome {
    /// Downloaded, verified, moved, recorded
    Fetched { bytes: u64 },
    /// Band not wanted
    SkippedBand { band: u8 },
    /// Name does not follow the scan naming pattern
    SkippedUnparseable,
    /// Ledger already holds the key; no I/O performed
    AlreadyFetched,
    /// Network failure; partial file removed
    TransportFailed { error: String },
    /// Download produced an empty file; removed, not recorded
    VerificationFailed,
    /// Local filesystem or ledger failure
    LocalFailed { error: String },
    /// Shutdown requested before or during the fetch
    Cancelled,
}

impl FetchOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            FetchOutcome::TransportFailed { .. }
                | FetchOutcome::VerificationFailed
                | FetchOutcome::LocalFailed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyReport {
    pub key: RemoteObjectKey,
    #[serde(flatten)]
    pub outcome: FetchOutcome,
}

/// Results of one dispatched batch, available once every task has finished
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub results: Vec<KeyReport>,
}

impl BatchReport {
    pub fn fetched(&self) -> usize {
        self.count(|o| matches!(o, FetchOutcome::Fetched { .. }))
    }

    pub fn already_fetched(&self) -> usize {
        self.count(|o| matches!(o, FetchOutcome::AlreadyFetched))
    }

    pub fn failed(&self) -> usize {
        self.count(FetchOutcome::is_failure)
    }

    pub fn transport_failures(&self) -> usize {
        self.count(|o| matches!(o, FetchOutcome::TransportFailed { .. }))
    }

    pub fn outcome_of(&self, key: &str) -> Option<&FetchOutcome> {
        self.results
            .iter()
            .find(|r| r.key.as_str() == key)
            .map(|r| &r.outcome)
    }

    fn count(&self, pred: impl Fn(&FetchOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// Pool settings
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub bands: BTreeSet<u8>,
    pub max_workers: usize,
    pub temp_dir: PathBuf,
    pub inbox_dir: PathBuf,
}

impl FetchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bands: config.download.bands.iter().copied().collect(),
            max_workers: config.download.max_workers.max(1),
            temp_dir: config.temp_dir(),
            inbox_dir: config.inbox_dir(),
        }
    }
}

/// Downloads batches of keys with at most `max_workers` in flight
pub struct FetchPool {
    store: Arc<dyn RemoteStore>,
    ledger: SharedLedger,
    settings: FetchSettings,
}

impl FetchPool {
    pub fn new(store: Arc<dyn RemoteStore>, ledger: SharedLedger, settings: FetchSettings) -> Self {
        Self {
            store,
            ledger,
            settings,
        }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Fetch every key of `bucket`; returns when all tasks have completed
    pub async fn fetch_batch(
        &self,
        bucket: TimeBucket,
        keys: Vec<RemoteObjectKey>,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let mut seen = BTreeSet::new();
        let keys: Vec<RemoteObjectKey> = keys
            .into_iter()
            .filter(|k| seen.insert(k.clone()))
            .collect();
        let total = keys.len();

        for dir in [&self.settings.temp_dir, &self.settings.inbox_dir] {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                error!(dir = %dir.display(), error = %e, "Cannot create directory");
            }
        }

        debug!(bucket = %bucket, keys = total, workers = self.settings.max_workers, "Dispatching batch");

        let results: Vec<KeyReport> = stream::iter(keys)
            .map(move |key| async move {
                let outcome = self.fetch_one(bucket, &key, cancel).await;
                KeyReport { key, outcome }
            })
            .buffer_unordered(self.settings.max_workers)
            .collect()
            .await;

        let report = BatchReport { results };
        info!(
            bucket = %bucket,
            total,
            fetched = report.fetched(),
            already = report.already_fetched(),
            failed = report.failed(),
            "Batch complete"
        );
        report
    }

    async fn fetch_one(
        &self,
        bucket: TimeBucket,
        key: &RemoteObjectKey,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        let scan = match key.scan() {
            Ok(scan) => scan,
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping object with unexpected name");
                return FetchOutcome::SkippedUnparseable;
            }
        };

        if !self.settings.bands.contains(&scan.band) {
            debug!(key = %key, band = scan.band, "Skipping unwanted band");
            return FetchOutcome::SkippedBand { band: scan.band };
        }

        if self.ledger.lock().await.contains(&bucket, key.as_str()) {
            debug!(key = %key, "Already fetched");
            return FetchOutcome::AlreadyFetched;
        }

        if cancel.is_cancelled() {
            return FetchOutcome::Cancelled;
        }

        let partial = self
            .settings
            .temp_dir
            .join(format!("{}{PARTIAL_SUFFIX}", scan.file_name));
        let final_path = self.settings.inbox_dir.join(&scan.file_name);

        info!(key = %key, "Downloading");
        let fetched = tokio::select! {
            result = self.store.fetch(key, &partial) => result,
            _ = cancel.cancelled() => {
                discard(&partial).await;
                return FetchOutcome::Cancelled;
            }
        };

        if let Err(e) = fetched {
            discard(&partial).await;
            error!(key = %key, error = %e, "Download failed");
            return if e.is_local() {
                FetchOutcome::LocalFailed {
                    error: e.to_string(),
                }
            } else {
                FetchOutcome::TransportFailed {
                    error: e.to_string(),
                }
            };
        }

        let size = match tokio::fs::metadata(&partial).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                discard(&partial).await;
                error!(key = %key, error = %e, "Downloaded file missing");
                return FetchOutcome::LocalFailed {
                    error: e.to_string(),
                };
            }
        };
        if size == 0 {
            discard(&partial).await;
            error!(key = %key, "Downloaded file is empty, discarding");
            return FetchOutcome::VerificationFailed;
        }

        if let Err(e) = move_file(&partial, &final_path).await {
            discard(&partial).await;
            error!(key = %key, error = %e, "Cannot move download into inbox");
            return FetchOutcome::LocalFailed {
                error: e.to_string(),
            };
        }

        let recorded = self.ledger.lock().await.record_success(bucket, key.as_str()).await;
        match recorded {
            Ok(true) => {
                info!(key = %key, bytes = size, path = %final_path.display(), "Fetched");
                FetchOutcome::Fetched { bytes: size }
            }
            Ok(false) => FetchOutcome::AlreadyFetched,
            Err(e) => {
                error!(key = %key, error = %e, "Fetched but could not record in ledger");
                FetchOutcome::LocalFailed {
                    error: e.to_string(),
                }
            }
        }
    }
}

/// Rename, falling back to [`copy_then_rename`] across filesystems
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(e),
        Err(e) => {
            debug!(from = %from.display(), to = %to.display(), error = %e, "Rename failed, copying");
            copy_then_rename(from, to).await
        }
    }
}

/// Copy `from` next to `to` under a partial name, then rename into place
///
/// `to` only ever appears complete; the staging name is not a scan file
/// name, so inbox watchers ignore it.
async fn copy_then_rename(from: &Path, to: &Path) -> std::io::Result<()> {
    let mut staging = to.as_os_str().to_owned();
    staging.push(PARTIAL_SUFFIX);
    let staging = PathBuf::from(staging);

    let copied = match tokio::fs::copy(from, &staging).await {
        Ok(_) => tokio::fs::rename(&staging, to).await,
        Err(e) => Err(e),
    };
    if let Err(e) = copied {
        discard(&staging).await;
        return Err(e);
    }
    tokio::fs::remove_file(from).await
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial download"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Cannot remove partial download"),
    }
}

/// Remove stale partial downloads left by a previous run
pub async fn clean_partials(temp_dir: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut entries = match tokio::fs::read_dir(temp_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_partial = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX));
        if is_partial {
            tokio::fs::remove_file(&path).await?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!(dir = %temp_dir.display(), removed, "Removed stale partial downloads");
    }
    Ok(removed)
}
