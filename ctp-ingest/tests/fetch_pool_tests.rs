//! Fetch worker pool integration tests

mod helpers;

use ctp_ingest::{
    FetchOutcome, FetchPool, FetchSettings, Ledger, LedgerLoad, RemoteObjectKey, SharedLedger,
};
use helpers::{bucket, full_hour, scan_key, test_config, MemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct Fixture {
    dir: TempDir,
    store: Arc<MemoryStore>,
    ledger: SharedLedger,
    pool: FetchPool,
}

fn fixture(max_workers: usize) -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.download.max_workers = max_workers;

    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(Mutex::new(Ledger::empty(config.ledger_path())));
    let pool = FetchPool::new(store.clone(), ledger.clone(), FetchSettings::from_config(&config));
    Fixture {
        dir,
        store,
        ledger,
        pool,
    }
}

fn keys(raw: &[String]) -> Vec<RemoteObjectKey> {
    raw.iter().map(|k| RemoteObjectKey::new(k.clone())).collect()
}

fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap()
}

#[tokio::test]
async fn test_successful_fetch_lands_in_inbox_and_ledger() {
    let f = fixture(1);
    let b = bucket(330, 12);
    let key = scan_key(b, 0, 13);
    f.store.publish(&key, b"payload");

    let report = f.pool.fetch_batch(b, keys(&[key.clone()]), &CancellationToken::new()).await;

    assert_eq!(report.outcome_of(&key), Some(&FetchOutcome::Fetched { bytes: 7 }));
    let inbox_file = f.dir.path().join("inbox").join(file_name(&key));
    assert_eq!(std::fs::read(&inbox_file).unwrap(), b"payload");
    assert!(f.ledger.lock().await.contains(&b, &key));
    assert_eq!(std::fs::read_dir(f.dir.path().join("temp")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_zero_size_download_is_discarded_and_not_recorded() {
    let f = fixture(1);
    let b = bucket(330, 12);
    let key = scan_key(b, 10, 13);
    f.store.publish(&key, b"");

    let report = f.pool.fetch_batch(b, keys(&[key.clone()]), &CancellationToken::new()).await;

    assert_eq!(report.outcome_of(&key), Some(&FetchOutcome::VerificationFailed));
    assert!(!f.dir.path().join("inbox").join(file_name(&key)).exists());
    assert_eq!(std::fs::read_dir(f.dir.path().join("temp")).unwrap().count(), 0);
    assert!(!f.ledger.lock().await.contains(&b, &key));
}

#[tokio::test]
async fn test_transport_failure_removes_partial_file() {
    let f = fixture(1);
    let b = bucket(330, 12);
    let key = scan_key(b, 20, 13);
    f.store.publish(&key, b"payload");
    f.store.fail_fetch(&key);

    let report = f.pool.fetch_batch(b, keys(&[key.clone()]), &CancellationToken::new()).await;

    assert!(matches!(
        report.outcome_of(&key),
        Some(FetchOutcome::TransportFailed { .. })
    ));
    assert_eq!(std::fs::read_dir(f.dir.path().join("temp")).unwrap().count(), 0);
    assert_eq!(f.ledger.lock().await.count(&b), 0);
}

#[tokio::test]
async fn test_missing_download_is_local_failure_and_leaves_nothing() {
    let f = fixture(1);
    let b = bucket(330, 12);
    let key = scan_key(b, 30, 13);
    f.store.publish(&key, b"payload");
    f.store.vanish_fetch(&key);

    let report = f.pool.fetch_batch(b, keys(&[key.clone()]), &CancellationToken::new()).await;

    assert!(matches!(
        report.outcome_of(&key),
        Some(FetchOutcome::LocalFailed { .. })
    ));
    assert_eq!(std::fs::read_dir(f.dir.path().join("temp")).unwrap().count(), 0);
    assert!(!f.dir.path().join("inbox").join(file_name(&key)).exists());
    assert!(!f.ledger.lock().await.contains(&b, &key));
}

#[tokio::test]
async fn test_failures_are_isolated_per_key() {
    let f = fixture(3);
    let b = bucket(330, 12);
    let all = full_hour(b);
    f.store.publish_all(&all);
    f.store.fail_fetch(&all[2]);

    let report = f.pool.fetch_batch(b, keys(&all), &CancellationToken::new()).await;

    assert_eq!(report.results.len(), 6);
    assert_eq!(report.fetched(), 5);
    assert_eq!(report.transport_failures(), 1);
    assert_eq!(f.ledger.lock().await.count(&b), 5);
}

#[tokio::test]
async fn test_refetch_of_recorded_key_does_no_io() {
    let f = fixture(2);
    let b = bucket(330, 12);
    let all = full_hour(b);
    f.store.publish_all(&all);

    let cancel = CancellationToken::new();
    let first = f.pool.fetch_batch(b, keys(&all), &cancel).await;
    let second = f.pool.fetch_batch(b, keys(&all), &cancel).await;

    assert_eq!(first.fetched(), 6);
    assert_eq!(second.already_fetched(), 6);
    assert_eq!(f.store.total_fetch_calls(), 6);
    assert_eq!(f.ledger.lock().await.count(&b), 6);
}

#[tokio::test]
async fn test_unwanted_band_and_bad_names_are_skipped() {
    let f = fixture(1);
    let b = bucket(330, 12);
    let other_band = scan_key(b, 0, 2);
    let junk = format!("{}index.html", b.remote_prefix(helpers::PRODUCT));
    f.store.publish(&other_band, b"x");
    f.store.publish(&junk, b"x");

    let report = f
        .pool
        .fetch_batch(b, keys(&[other_band.clone(), junk.clone()]), &CancellationToken::new())
        .await;

    assert_eq!(report.outcome_of(&other_band), Some(&FetchOutcome::SkippedBand { band: 2 }));
    assert_eq!(report.outcome_of(&junk), Some(&FetchOutcome::SkippedUnparseable));
    assert_eq!(f.store.total_fetch_calls(), 0);
}

#[tokio::test]
async fn test_duplicate_keys_in_one_batch_fetch_once() {
    let f = fixture(4);
    let b = bucket(330, 12);
    let key = scan_key(b, 0, 13);
    f.store.publish(&key, b"x");

    let report = f
        .pool
        .fetch_batch(b, keys(&[key.clone(), key.clone()]), &CancellationToken::new())
        .await;

    assert_eq!(report.results.len(), 1);
    assert_eq!(f.store.fetch_calls(&key), 1);
}

#[tokio::test]
async fn test_concurrency_is_bounded_by_max_workers() {
    let f = fixture(2);
    let b = bucket(330, 12);
    let all = full_hour(b);
    f.store.publish_all(&all);
    f.store.set_fetch_delay(Duration::from_millis(20));

    let report = f.pool.fetch_batch(b, keys(&all), &CancellationToken::new()).await;

    assert_eq!(report.fetched(), 6);
    assert!(f.store.max_in_flight() <= 2);
    assert!(f.store.max_in_flight() >= 1);

    // Every concurrent record reached the ledger file
    let path = test_config(f.dir.path()).ledger_path();
    let (reloaded, load) = Ledger::open(path).await.unwrap();
    assert_eq!(load, LedgerLoad::Loaded { buckets: 1, keys: 6 });
    assert_eq!(reloaded.count(&b), 6);
    for key in &all {
        assert!(reloaded.contains(&b, key));
    }
}

#[tokio::test]
async fn test_cancelled_batch_records_nothing() {
    let f = fixture(1);
    let b = bucket(330, 12);
    let all = full_hour(b);
    f.store.publish_all(&all);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = f.pool.fetch_batch(b, keys(&all), &cancel).await;

    assert!(report
        .results
        .iter()
        .all(|r| r.outcome == FetchOutcome::Cancelled));
    assert_eq!(f.ledger.lock().await.count(&b), 0);
}
