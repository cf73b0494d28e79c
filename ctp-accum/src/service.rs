//! Accumulation service loop
//!
//! Single producer for the window: turns announced inbox files into masks
//! and inserts them at their capture-time position, so frames announced out
//! of order still accumulate. A frame that fails preprocessing is dropped
//! with a warning. A shape mismatch stops the service.

use crate::error::{AccumError, PreprocessError, Result};
use crate::frame::ThresholdMask;
use crate::inbox::list_scans;
use crate::preprocess::Preprocessor;
use crate::snapshot::{SnapshotDocument, SnapshotExporter};
use crate::window::{InsertOutcome, SharedWindow};
use chrono::{DateTime, Utc};
use ctp_common::ScanName;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Published after every handled frame
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceStatus {
    pub frames_inserted: u64,
    pub frames_dropped: u64,
    pub window_frames: usize,
    pub latest_capture: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// What happened to one announced file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDisposition {
    Inserted { frames: usize },
    /// Path already handled, or its capture time is already in the window
    Duplicate,
    /// Window is full and the frame is older than everything in it
    Stale,
    /// Preprocessing failed
    Dropped { reason: String },
}

pub struct AccumulationService {
    preprocessor: Preprocessor,
    window: SharedWindow,
    exporter: SnapshotExporter,
    handled: HashSet<PathBuf>,
    status: watch::Sender<ServiceStatus>,
}

impl AccumulationService {
    pub fn new(preprocessor: Preprocessor, window: SharedWindow, exporter: SnapshotExporter) -> Self {
        let (status, _) = watch::channel(ServiceStatus::default());
        Self {
            preprocessor,
            window,
            exporter,
            handled: HashSet::new(),
            status,
        }
    }

    pub fn window(&self) -> SharedWindow {
        self.window.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.status.subscribe()
    }

    /// Seed the window from the cold-start files
    ///
    /// Files that fail preprocessing are skipped; the rest are inserted
    /// in capture order. Returns the number of seeded frames.
    pub async fn bootstrap(&mut self, paths: &[PathBuf]) -> Result<usize> {
        let mut masks: Vec<ThresholdMask> = Vec::with_capacity(paths.len());
        for path in paths {
            match self.preprocessor.process(path).await {
                Ok(mask) => {
                    self.handled.insert(path.clone());
                    masks.push(mask);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping initial frame");
                    self.record_drop(&e);
                }
            }
        }

        masks.sort_by_key(|m| m.captured_at());
        masks.dedup_by_key(|m| m.captured_at());

        let seeded = self.window.write().await.bootstrap(masks)?;
        info!(requested = paths.len(), seeded, "Accumulation bootstrapped");
        if seeded > 0 {
            self.export().await;
        }
        self.publish(|s| s.frames_inserted += seeded as u64).await;
        Ok(seeded)
    }

    /// Process scans already sitting in the inbox, oldest first
    pub async fn catch_up(&mut self, inbox: &Path) -> Result<usize> {
        let mut inserted = 0;
        for path in list_scans(inbox).await? {
            if let FrameDisposition::Inserted { .. } = self.handle(&path).await? {
                inserted += 1;
            }
        }
        if inserted > 0 {
            info!(inserted, "Caught up with inbox");
        }
        Ok(inserted)
    }

    /// Handle one announced file
    pub async fn handle(&mut self, path: &Path) -> Result<FrameDisposition> {
        if self.handled.contains(path) {
            debug!(path = %path.display(), "Already handled");
            return Ok(FrameDisposition::Duplicate);
        }

        let mask = match self.preprocessor.process(path).await {
            Ok(mask) => mask,
            Err(e) => {
                // The file may still be landing; a later announcement retries it
                if !matches!(e, PreprocessError::InvalidFile { .. }) {
                    self.handled.insert(path.to_path_buf());
                }
                warn!(path = %path.display(), error = %e, "Dropping frame");
                self.record_drop(&e);
                return Ok(FrameDisposition::Dropped {
                    reason: e.to_string(),
                });
            }
        };
        self.handled.insert(path.to_path_buf());

        let captured_at = mask.captured_at();
        let mut window = self.window.write().await;
        let outcome = match window.insert(mask) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Mask does not fit the window");
                return Err(AccumError::Window(e));
            }
        };
        let frames = window.len();
        let oldest = window.oldest_capture().filter(|_| frames >= window.capacity());
        drop(window);

        match outcome {
            InsertOutcome::Inserted { .. } => {}
            InsertOutcome::AlreadyPresent => {
                debug!(path = %path.display(), captured_at = %captured_at, "Capture already in window");
                return Ok(FrameDisposition::Duplicate);
            }
            InsertOutcome::TooOld => {
                warn!(
                    path = %path.display(),
                    captured_at = %captured_at,
                    "Dropping frame older than the full window"
                );
                self.publish(|s| s.frames_dropped += 1).await;
                return Ok(FrameDisposition::Stale);
            }
        }
        if let Some(oldest) = oldest {
            self.forget_before(oldest);
        }

        info!(path = %path.display(), captured_at = %captured_at, frames, "Frame accumulated");
        self.export().await;
        self.publish(|s| s.frames_inserted += 1).await;
        Ok(FrameDisposition::Inserted { frames })
    }

    /// Consume announcements until the channel closes or `cancel` fires
    pub async fn run(&mut self, mut rx: mpsc::Receiver<PathBuf>, cancel: &CancellationToken) -> Result<()> {
        loop {
            let path = tokio::select! {
                path = rx.recv() => match path {
                    Some(path) => path,
                    None => {
                        info!("Inbox trigger closed");
                        return Ok(());
                    }
                },
                _ = cancel.cancelled() => {
                    info!("Accumulation cancelled");
                    return Ok(());
                }
            };
            self.handle(&path).await?;
        }
    }

    /// Drop handled paths whose scans can no longer enter the window
    fn forget_before(&mut self, oldest: DateTime<Utc>) {
        let before = self.handled.len();
        self.handled.retain(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| ScanName::parse(n).ok())
                .is_some_and(|scan| scan.scan_start.and_utc() >= oldest)
        });
        let forgotten = before - self.handled.len();
        if forgotten > 0 {
            debug!(forgotten, "Forgot paths that left the window");
        }
    }

    async fn export(&self) {
        let snapshot = self.window.read().await.snapshot();
        let Some(snapshot) = snapshot else {
            return;
        };
        let document = SnapshotDocument::new(snapshot, self.preprocessor.settings().threshold_celsius);
        if let Err(e) = self.exporter.export(&document).await {
            error!(path = %self.exporter.path().display(), error = %e, "Snapshot export failed");
            self.status.send_modify(|s| s.last_error = Some(e.to_string()));
        }
    }

    fn record_drop(&self, e: &PreprocessError) {
        self.status.send_modify(|s| {
            s.frames_dropped += 1;
            s.last_error = Some(e.to_string());
        });
    }

    async fn publish(&self, update: impl FnOnce(&mut ServiceStatus)) {
        let window = self.window.read().await;
        let window_frames = window.len();
        let latest_capture = window.latest().map(|m| m.captured_at);
        drop(window);

        self.status.send_modify(|s| {
            update(s);
            s.window_frames = window_frames;
            s.latest_capture = latest_capture;
            s.updated_at = Some(Utc::now());
        });
    }
}
