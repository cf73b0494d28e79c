//! Ingestion scheduler
//!
//! Walks the archive one hourly bucket at a time, strictly in order:
//!
//! ```text
//! AwaitingListing ──empty/error──▶ AwaitingListing (after backoff)
//!        │ keys found
//!        ▼
//!   Dispatching ──batch drained──▶ AwaitingCompletion
//!                                        │ complete → advance one hour
//!                                        │ short    → AwaitingListing (after poll timeout)
//! ```
//!
//! A bucket is never skipped and never marked complete without its
//! expected object count in the ledger. All waiting goes through the
//! injected [`Clock`], so the whole machine runs instantly under test.

use crate::clock::Clock;
use crate::error::Result;
use crate::fetch_pool::{BatchReport, FetchPool, FetchSettings};
use crate::ledger::SharedLedger;
use crate::remote::{RemoteObjectKey, RemoteStore};
use crate::retry::{RetryEvent, RetryPolicy, RetryState};
use chrono::{DateTime, NaiveDateTime, Utc};
use ctp_common::config::Config;
use ctp_common::TimeBucket;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scheduler state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    AwaitingListing,
    Dispatching(Vec<RemoteObjectKey>),
    AwaitingCompletion,
    Halted,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::AwaitingListing => "awaiting_listing",
            Phase::Dispatching(_) => "dispatching",
            Phase::AwaitingCompletion => "awaiting_completion",
            Phase::Halted => "halted",
        }
    }
}

/// Result of one [`IngestScheduler::step`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Keep going after waiting `wait` (possibly zero)
    Continue { wait: Duration },
    /// End time passed; nothing more to do
    Halted,
}

/// Snapshot published on every transition
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub phase: &'static str,
    pub current_bucket: String,
    pub bucket_count: usize,
    pub expected_per_bucket: usize,
    pub retry: RetryState,
    pub buckets_completed: u64,
    pub objects_fetched: u64,
    pub fetch_failures: u64,
    pub remote_reachable: bool,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Drives listing, dispatch and completion checks bucket by bucket
pub struct IngestScheduler {
    store: Arc<dyn RemoteStore>,
    ledger: SharedLedger,
    pool: FetchPool,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    retry: RetryState,
    product: String,
    bands: BTreeSet<u8>,
    expected: usize,
    end: Option<NaiveDateTime>,
    bucket: TimeBucket,
    phase: Phase,
    cancel: CancellationToken,
    status: watch::Sender<SchedulerStatus>,
    buckets_completed: u64,
    objects_fetched: u64,
    fetch_failures: u64,
    remote_reachable: bool,
    last_error: Option<String>,
}

impl IngestScheduler {
    /// Build a scheduler positioned at the resume point
    ///
    /// The first bucket is the hour after the latest complete bucket in the
    /// ledger, or the configured start when the ledger has none.
    pub async fn new(
        config: &Config,
        store: Arc<dyn RemoteStore>,
        ledger: SharedLedger,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let expected = config.download.expected_per_bucket();
        let end = config.download.end_instant()?;

        let resume = ledger.lock().await.last_completed_bucket(expected);
        let bucket = match resume {
            Some(done) => {
                info!(last_complete = %done, resume = %done.next(), "Resuming after last complete bucket");
                done.next()
            }
            None => {
                let start = config.download.start_instant(clock.today())?;
                let bucket = TimeBucket::containing(start);
                info!(start = %bucket, "No complete bucket in ledger, starting from configured start");
                bucket
            }
        };

        let pool = FetchPool::new(
            store.clone(),
            ledger.clone(),
            FetchSettings::from_config(config),
        );

        let initial = SchedulerStatus {
            phase: Phase::AwaitingListing.name(),
            current_bucket: bucket.to_string(),
            bucket_count: 0,
            expected_per_bucket: expected,
            retry: RetryState::default(),
            buckets_completed: 0,
            objects_fetched: 0,
            fetch_failures: 0,
            remote_reachable: false,
            last_error: None,
            updated_at: Utc::now(),
        };
        let (status, _) = watch::channel(initial);

        Ok(Self {
            store,
            ledger,
            pool,
            clock,
            policy: RetryPolicy::from_config(&config.download),
            retry: RetryState::default(),
            product: product_segment(&config.remote.product).to_string(),
            bands: config.download.bands.iter().copied().collect(),
            expected,
            end,
            bucket,
            phase: Phase::AwaitingListing,
            cancel,
            status,
            buckets_completed: 0,
            objects_fetched: 0,
            fetch_failures: 0,
            remote_reachable: false,
            last_error: None,
        })
    }

    pub fn current_bucket(&self) -> TimeBucket {
        self.bucket
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry
    }

    /// Receiver for status snapshots
    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.subscribe()
    }

    /// Probe the remote until it answers; `false` if cancelled first
    pub async fn wait_for_remote(&mut self) -> bool {
        loop {
            match self.store.probe().await {
                Ok(()) => {
                    info!("Remote store reachable");
                    self.remote_reachable = true;
                    self.publish().await;
                    return true;
                }
                Err(e) => {
                    error!(error = %e, "Remote store unreachable, retrying");
                    self.remote_reachable = false;
                    self.last_error = Some(e.to_string());
                    self.publish().await;
                    let wait = self.policy.reconnect_interval;
                    if !self.sleep_or_cancel(wait).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Run until halted or cancelled
    pub async fn run(&mut self) {
        if !self.wait_for_remote().await {
            info!("Shutdown requested before remote became reachable");
            return;
        }

        loop {
            if self.cancel.is_cancelled() {
                info!(bucket = %self.bucket, "Shutdown requested, stopping scheduler");
                break;
            }
            match self.step().await {
                StepOutcome::Halted => break,
                StepOutcome::Continue { wait } => {
                    if !wait.is_zero() && !self.sleep_or_cancel(wait).await {
                        info!(bucket = %self.bucket, "Shutdown requested, stopping scheduler");
                        break;
                    }
                }
            }
        }
    }

    /// Perform one transition
    pub async fn step(&mut self) -> StepOutcome {
        let phase = std::mem::replace(&mut self.phase, Phase::AwaitingListing);
        let outcome = match phase {
            Phase::Halted => {
                self.phase = Phase::Halted;
                StepOutcome::Halted
            }
            Phase::AwaitingListing => self.on_awaiting_listing().await,
            Phase::Dispatching(keys) => self.on_dispatching(keys).await,
            Phase::AwaitingCompletion => self.on_awaiting_completion().await,
        };
        self.publish().await;
        outcome
    }

    async fn on_awaiting_listing(&mut self) -> StepOutcome {
        if let Some(end) = self.end {
            if self.bucket.start() > end {
                info!(bucket = %self.bucket, end = %end, "Reached configured end time, ingestion complete");
                self.phase = Phase::Halted;
                return StepOutcome::Halted;
            }
        }

        if self.ledger.lock().await.is_complete(&self.bucket, self.expected) {
            debug!(bucket = %self.bucket, "Bucket already complete in ledger, advancing");
            self.advance();
            return StepOutcome::Continue {
                wait: Duration::ZERO,
            };
        }

        info!(bucket = %self.bucket, "Listing remote bucket");
        let listed = match self.store.list(&self.bucket).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(bucket = %self.bucket, error = %e, "Listing failed");
                self.remote_reachable = false;
                self.last_error = Some(e.to_string());
                let wait = self.apply(RetryEvent::TransportError);
                return StepOutcome::Continue { wait };
            }
        };
        self.remote_reachable = true;

        let wanted: Vec<RemoteObjectKey> = listed
            .into_iter()
            .filter(|key| self.is_expected_key(key))
            .collect();

        if wanted.is_empty() {
            info!(bucket = %self.bucket, "No matching objects published yet");
            let wait = self.apply(RetryEvent::EmptyListing);
            return StepOutcome::Continue { wait };
        }

        info!(bucket = %self.bucket, available = wanted.len(), "Objects available");
        self.phase = Phase::Dispatching(wanted);
        StepOutcome::Continue {
            wait: Duration::ZERO,
        }
    }

    async fn on_dispatching(&mut self, keys: Vec<RemoteObjectKey>) -> StepOutcome {
        let report = self.pool.fetch_batch(self.bucket, keys, &self.cancel).await;
        self.record_report(&report);
        self.phase = Phase::AwaitingCompletion;
        StepOutcome::Continue {
            wait: Duration::ZERO,
        }
    }

    async fn on_awaiting_completion(&mut self) -> StepOutcome {
        let count = self.ledger.lock().await.count(&self.bucket);
        if count >= self.expected {
            info!(bucket = %self.bucket, count, "All objects for bucket fetched");
            self.apply(RetryEvent::BucketComplete);
            self.buckets_completed += 1;
            self.advance();
            return StepOutcome::Continue {
                wait: Duration::ZERO,
            };
        }

        info!(
            bucket = %self.bucket,
            count,
            expected = self.expected,
            "Bucket incomplete, waiting for next object"
        );
        let wait = self.apply(RetryEvent::BucketIncomplete);
        StepOutcome::Continue { wait }
    }

    fn apply(&mut self, event: RetryEvent) -> Duration {
        let (next, decision) = self.policy.apply(&self.retry, event);
        self.retry = next;
        if decision.escalated {
            warn!(
                bucket = %self.bucket,
                threshold = self.policy.empty_threshold,
                wait_secs = decision.wait.as_secs(),
                "Repeated empty listings, waiting longer"
            );
        }
        if decision.stalled {
            warn!(
                bucket = %self.bucket,
                ceiling_secs = self.policy.elapsed_ceiling.as_secs(),
                "Bucket still incomplete after wait ceiling, continuing to wait"
            );
        }
        decision.wait
    }

    fn advance(&mut self) {
        self.bucket = self.bucket.next();
        self.phase = Phase::AwaitingListing;
    }

    fn record_report(&mut self, report: &BatchReport) {
        self.objects_fetched += report.fetched() as u64;
        self.fetch_failures += report.failed() as u64;
        if let Some(failure) = report.results.iter().find(|r| r.outcome.is_failure()) {
            self.last_error = Some(format!("{}: {:?}", failure.key, failure.outcome));
        }
    }

    /// Scan of a wanted band, of the configured product, starting inside the current bucket
    fn is_expected_key(&self, key: &RemoteObjectKey) -> bool {
        match key.scan() {
            Ok(scan) => {
                scan.product == self.product
                    && self.bands.contains(&scan.band)
                    && scan.bucket() == self.bucket
            }
            Err(_) => false,
        }
    }

    async fn sleep_or_cancel(&self, wait: Duration) -> bool {
        tokio::select! {
            _ = self.clock.sleep(wait) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    async fn publish(&self) {
        let bucket_count = self.ledger.lock().await.count(&self.bucket);
        self.status.send_replace(SchedulerStatus {
            phase: self.phase.name(),
            current_bucket: self.bucket.to_string(),
            bucket_count,
            expected_per_bucket: self.expected,
            retry: self.retry,
            buckets_completed: self.buckets_completed,
            objects_fetched: self.objects_fetched,
            fetch_failures: self.fetch_failures,
            remote_reachable: self.remote_reachable,
            last_error: self.last_error.clone(),
            updated_at: Utc::now(),
        });
    }
}

/// Product as it appears in scan names (`ABI-L1b-RadF`), given a possibly nested prefix
fn product_segment(product: &str) -> &str {
    product
        .trim_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(product)
}
