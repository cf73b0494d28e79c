//! Inbox triggers
//!
//! New scan files are announced on an `mpsc` channel, either from
//! filesystem notifications or from a periodic directory scan. Both are
//! at-least-once: the same path may be announced more than once and the
//! consumer is expected to ignore repeats.

use crate::error::{AccumError, Result};
use ctp_common::config::TriggerMode;
use ctp_common::scan_name::{ScanName, SCAN_EXTENSION};
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 256;

/// Keeps the active trigger alive; dropping it stops notifications
pub enum TriggerHandle {
    Watch(RecommendedWatcher),
    Poll(JoinHandle<()>),
}

/// Start the configured trigger on `dir`
pub fn start_trigger(
    mode: TriggerMode,
    dir: &Path,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> Result<(mpsc::Receiver<PathBuf>, TriggerHandle)> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = match mode {
        TriggerMode::Watch => TriggerHandle::Watch(watch_inbox(dir, tx)?),
        TriggerMode::Poll => {
            let dir = dir.to_path_buf();
            TriggerHandle::Poll(tokio::spawn(poll_inbox(dir, poll_interval, tx, cancel)))
        }
    };
    info!(dir = %dir.display(), mode = ?mode, "Inbox trigger started");
    Ok((rx, handle))
}

/// Filesystem watcher forwarding newly completed scan files
pub fn watch_inbox(dir: &Path, tx: mpsc::Sender<PathBuf>) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !is_arrival(&event.kind) {
                    return;
                }
                for path in event.paths.into_iter().filter(|p| is_scan_file(p)) {
                    // Receiver gone means the service is shutting down
                    if tx.blocking_send(path).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Inbox watcher error"),
        },
        notify::Config::default(),
    )
    .map_err(|e| AccumError::Inbox(format!("watcher init failed: {e}")))?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| AccumError::Inbox(format!("cannot watch {}: {e}", dir.display())))?;
    Ok(watcher)
}

/// Created, moved in, or closed after writing
fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

/// Size and modification time of an announced file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

async fn stamp_of(path: &Path) -> Option<FileStamp> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some(FileStamp {
        len: meta.len(),
        modified: meta.modified().ok(),
    })
}

/// Periodically scan `dir`, announcing new scan files
///
/// A file is announced again when its size or modification time changes,
/// so a file that was still being written on the first pass is offered
/// once more when it is complete. Files that left the inbox are forgotten.
pub async fn poll_inbox(
    dir: PathBuf,
    interval: Duration,
    tx: mpsc::Sender<PathBuf>,
    cancel: CancellationToken,
) {
    let mut announced: HashMap<PathBuf, FileStamp> = HashMap::new();
    loop {
        match list_scans(&dir).await {
            Ok(paths) => {
                let present: HashSet<&PathBuf> = paths.iter().collect();
                announced.retain(|path, _| present.contains(path));

                for path in &paths {
                    let Some(stamp) = stamp_of(path).await else {
                        continue;
                    };
                    if announced.get(path) == Some(&stamp) {
                        continue;
                    }
                    if tx.send(path.clone()).await.is_err() {
                        return;
                    }
                    announced.insert(path.clone(), stamp);
                }
            }
            Err(e) => warn!(dir = %dir.display(), error = %e, "Inbox scan failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

fn is_scan_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(SCAN_EXTENSION) && ScanName::parse(n).is_ok())
}

/// Scan files in `dir`, oldest scan first
pub async fn list_scans(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut scans = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(SCAN_EXTENSION) {
            continue;
        }
        if let Ok(scan) = ScanName::parse(name) {
            scans.push((scan.scan_start, path));
        }
    }
    scans.sort();
    Ok(scans.into_iter().map(|(_, path)| path).collect())
}

/// Block until `dir` holds at least `count` scans; returns the oldest `count`
///
/// `None` when cancelled first.
pub async fn wait_for_initial_frames(
    dir: &Path,
    count: usize,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<Option<Vec<PathBuf>>> {
    loop {
        let mut scans = list_scans(dir).await?;
        if scans.len() >= count {
            scans.truncate(count);
            return Ok(Some(scans));
        }
        info!(
            dir = %dir.display(),
            available = scans.len(),
            required = count,
            "Waiting for initial frames"
        );
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => {
                debug!("Initial frame wait cancelled");
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scan(minute: u32) -> String {
        format!("OR_ABI-L1b-RadF-M6C13_G16_s202433012{minute:02}205_e202433012{minute:02}599_c202433012{minute:02}599.nc")
    }

    #[tokio::test]
    async fn test_list_scans_orders_by_scan_start() {
        let dir = TempDir::new().unwrap();
        for name in [scan(4), scan(1), scan(3)] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("garbage.nc"), b"x").unwrap();

        let names: Vec<String> = list_scans(dir.path())
            .await
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![scan(1), scan(3), scan(4)]);

        assert!(list_scans(&dir.path().join("missing")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_initial_frames_returns_oldest() {
        let dir = TempDir::new().unwrap();
        for m in [5, 2, 4] {
            std::fs::write(dir.path().join(scan(m)), b"x").unwrap();
        }
        let cancel = CancellationToken::new();
        let frames = wait_for_initial_frames(dir.path(), 2, Duration::from_millis(10), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frames, vec![dir.path().join(scan(2)), dir.path().join(scan(4))]);
    }

    #[tokio::test]
    async fn test_wait_for_initial_frames_polls_until_enough() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().to_path_buf();
        let cancel = CancellationToken::new();

        let writer = tokio::spawn({
            let path = path.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::fs::write(path.join(scan(1)), b"x").unwrap();
            }
        });

        let frames = wait_for_initial_frames(&path, 1, Duration::from_millis(10), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frames.len(), 1);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_initial_frames_cancel() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let frames = wait_for_initial_frames(dir.path(), 6, Duration::from_secs(30), &cancel)
            .await
            .unwrap();
        assert!(frames.is_none());
    }

    #[tokio::test]
    async fn test_poller_announces_each_file_once() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(scan(1)), b"x").unwrap();

        let cancel = CancellationToken::new();
        let (mut rx, handle) = start_trigger(
            TriggerMode::Poll,
            dir.path(),
            Duration::from_millis(10),
            cancel.clone(),
        )
        .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, dir.path().join(scan(1)));

        std::fs::write(dir.path().join(scan(2)), b"x").unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, dir.path().join(scan(2)));

        // No repeats of already announced files
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());

        cancel.cancel();
        if let TriggerHandle::Poll(task) = handle {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_poller_reannounces_file_that_grew() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(scan(1));
        std::fs::write(&path, b"").unwrap();

        let cancel = CancellationToken::new();
        let (mut rx, _handle) = start_trigger(
            TriggerMode::Poll,
            dir.path(),
            Duration::from_millis(10),
            cancel.clone(),
        )
        .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, path);

        std::fs::write(&path, b"complete scan").unwrap();
        let again = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again, path);

        // Removed then restored: forgotten in between, so offered again
        std::fs::remove_file(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&path, b"complete scan").unwrap();
        let restored = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored, path);

        cancel.cancel();
    }

    #[test]
    fn test_arrival_kinds() {
        assert!(is_arrival(&EventKind::Create(CreateKind::File)));
        assert!(is_arrival(&EventKind::Modify(ModifyKind::Name(
            notify::event::RenameMode::To
        ))));
        assert!(!is_arrival(&EventKind::Remove(notify::event::RemoveKind::File)));
        assert!(!is_arrival(&EventKind::Modify(ModifyKind::Data(
            notify::event::DataChange::Content
        ))));
    }
}
