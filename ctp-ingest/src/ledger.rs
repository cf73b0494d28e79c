//! Durable record of fetched objects
//!
//! The ledger maps each hourly bucket to the set of object keys that have
//! been downloaded, verified, and moved into the inbox. It is the only
//! source of truth for resuming after a restart and is rewritten in full
//! (temp file + rename) after every successful fetch.
//!
//! On-disk format is a nested mapping keyed by zero-padded strings:
//!
//! ```json
//! { "2024": { "330": { "12": ["ABI-L1b-RadF/2024/330/12/OR_...nc"] } } }
//! ```

use crate::error::{IngestError, Result};
use ctp_common::fs::write_json_atomic;
use ctp_common::TimeBucket;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Ledger shared between the scheduler and fetch workers
///
/// The mutex is held across insert + persist so writes never interleave.
pub type SharedLedger = Arc<Mutex<Ledger>>;

/// Nested on-disk representation: year → day → hour → keys
type LedgerFile = BTreeMap<String, BTreeMap<String, BTreeMap<String, Vec<String>>>>;

/// How the ledger came to be in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerLoad {
    /// No file existed; an empty one was written
    Created,
    /// Existing file parsed
    Loaded { buckets: usize, keys: usize },
    /// File was unreadable; reinitialized empty and the old content set aside
    Reset { reason: String },
}

/// Bucket → fetched keys
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    buckets: BTreeMap<TimeBucket, BTreeSet<String>>,
}

impl Ledger {
    /// Empty ledger bound to `path`; nothing is written until the first record
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            buckets: BTreeMap::new(),
        }
    }

    /// Load from `path`, creating or resetting the file as needed
    ///
    /// Corruption is not an error: the unreadable file is moved aside to
    /// `<path>.corrupt`, an empty ledger is written in its place, and the
    /// caller learns about it through [`LedgerLoad::Reset`].
    pub async fn open(path: impl Into<PathBuf>) -> Result<(Self, LedgerLoad)> {
        let path = path.into();

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Creating empty download ledger");
                let ledger = Self::empty(path);
                ledger.persist().await?;
                return Ok((ledger, LedgerLoad::Created));
            }
            Err(e) => return Err(e.into()),
        };

        match parse_ledger(&bytes) {
            Ok(buckets) => {
                let keys = buckets.values().map(BTreeSet::len).sum();
                info!(
                    path = %path.display(),
                    buckets = buckets.len(),
                    keys,
                    "Loaded download ledger"
                );
                let load = LedgerLoad::Loaded {
                    buckets: buckets.len(),
                    keys,
                };
                Ok((Self { path, buckets }, load))
            }
            Err(reason) => {
                warn!(
                    path = %path.display(),
                    reason = %reason,
                    "Download ledger is corrupt, reinitializing empty; already-downloaded files will be fetched again"
                );
                let aside = corrupt_sibling(&path);
                if let Err(e) = tokio::fs::rename(&path, &aside).await {
                    warn!(error = %e, "Could not move corrupt ledger aside");
                }
                let ledger = Self::empty(path);
                ledger.persist().await?;
                Ok((ledger, LedgerLoad::Reset { reason }))
            }
        }
    }

    /// Open and wrap for sharing
    pub async fn open_shared(path: impl Into<PathBuf>) -> Result<(SharedLedger, LedgerLoad)> {
        let (ledger, load) = Self::open(path).await?;
        Ok((Arc::new(Mutex::new(ledger)), load))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, bucket: &TimeBucket, key: &str) -> bool {
        self.buckets
            .get(bucket)
            .is_some_and(|keys| keys.contains(key))
    }

    /// Number of keys recorded for `bucket`
    pub fn count(&self, bucket: &TimeBucket) -> usize {
        self.buckets.get(bucket).map_or(0, BTreeSet::len)
    }

    pub fn is_complete(&self, bucket: &TimeBucket, expected: usize) -> bool {
        self.count(bucket) >= expected
    }

    /// Latest bucket holding at least `expected` keys
    pub fn last_completed_bucket(&self, expected: usize) -> Option<TimeBucket> {
        self.buckets
            .iter()
            .rev()
            .find(|(_, keys)| keys.len() >= expected)
            .map(|(bucket, _)| *bucket)
    }

    /// Total keys across all buckets
    pub fn total_keys(&self) -> usize {
        self.buckets.values().map(BTreeSet::len).sum()
    }

    /// Record a verified fetch and persist before returning
    ///
    /// Returns `false` (and writes nothing) when the key was already present.
    /// If persisting fails the in-memory insert is rolled back, so memory
    /// never claims more than disk.
    pub async fn record_success(&mut self, bucket: TimeBucket, key: &str) -> Result<bool> {
        if self.contains(&bucket, key) {
            debug!(bucket = %bucket, key, "Key already recorded");
            return Ok(false);
        }

        self.buckets.entry(bucket).or_default().insert(key.to_string());

        if let Err(e) = self.persist().await {
            if let Some(keys) = self.buckets.get_mut(&bucket) {
                keys.remove(key);
                if keys.is_empty() {
                    self.buckets.remove(&bucket);
                }
            }
            return Err(e);
        }

        debug!(bucket = %bucket, key, count = self.count(&bucket), "Recorded fetch");
        Ok(true)
    }

    /// Rewrite the whole ledger atomically
    pub async fn persist(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.to_file())
            .await
            .map_err(|e| IngestError::Ledger(format!("persist {}: {e}", self.path.display())))
    }

    fn to_file(&self) -> LedgerFile {
        let mut file = LedgerFile::new();
        for (bucket, keys) in &self.buckets {
            let (year, day, hour) = bucket.ledger_parts();
            file.entry(year)
                .or_default()
                .entry(day)
                .or_default()
                .insert(hour, keys.iter().cloned().collect());
        }
        file
    }
}

fn parse_ledger(bytes: &[u8]) -> std::result::Result<BTreeMap<TimeBucket, BTreeSet<String>>, String> {
    // An empty file is what a crash mid-write of a non-atomic writer leaves behind
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err("file is empty".to_string());
    }

    let file: LedgerFile = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;

    let mut buckets = BTreeMap::new();
    for (year, days) in &file {
        for (day, hours) in days {
            for (hour, keys) in hours {
                let bucket =
                    TimeBucket::from_parts(year, day, hour).map_err(|e| e.to_string())?;
                let set: BTreeSet<String> = keys.iter().cloned().collect();
                if !set.is_empty() {
                    buckets.insert(bucket, set);
                }
            }
        }
    }
    Ok(buckets)
}

fn corrupt_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".corrupt");
    path.with_file_name(name)
}
