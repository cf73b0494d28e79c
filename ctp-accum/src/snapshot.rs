//! Persistence snapshot export
//!
//! The running sum (in hours) is written to `<workdir>/persistence.json`
//! after every insert for the rendering side to pick up. Writes go through
//! a temp file and rename so readers never see a partial document.

use crate::window::WindowSnapshot;
use chrono::{DateTime, Utc};
use ctp_common::fs::write_json_atomic;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const SNAPSHOT_FILE: &str = "persistence.json";

/// Exported document
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDocument {
    pub generated_at: DateTime<Utc>,
    pub threshold_celsius: f32,
    #[serde(flatten)]
    pub snapshot: WindowSnapshot,
}

impl SnapshotDocument {
    pub fn new(snapshot: WindowSnapshot, threshold_celsius: f32) -> Self {
        Self {
            generated_at: Utc::now(),
            threshold_celsius,
            snapshot,
        }
    }
}

/// Writes snapshots to a fixed location
#[derive(Debug, Clone)]
pub struct SnapshotExporter {
    path: PathBuf,
}

impl SnapshotExporter {
    pub fn new(workdir: &Path) -> Self {
        Self {
            path: workdir.join(SNAPSHOT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn export(&self, document: &SnapshotDocument) -> ctp_common::Result<()> {
        write_json_atomic(&self.path, document).await?;
        tracing::debug!(
            path = %self.path.display(),
            frames = document.snapshot.frames,
            "Snapshot exported"
        );
        Ok(())
    }
}
