//! Shared fixtures for ctp-ingest integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use ctp_common::config::Config;
use ctp_common::TimeBucket;
use ctp_ingest::{RemoteError, RemoteObjectKey, RemoteStore};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const PRODUCT: &str = "ABI-L1b-RadF";

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 11, 25).unwrap()
}

pub fn bucket(day: u32, hour: u32) -> TimeBucket {
    TimeBucket::new(2024, day, hour).unwrap()
}

/// Object key for one scan of `band` starting `minute` minutes into `bucket`
pub fn scan_key(bucket: TimeBucket, minute: u32, band: u8) -> String {
    let stamp = format!("{}{:02}21", bucket.scan_stamp(), minute);
    format!(
        "{}OR_{PRODUCT}-M6C{band:02}_G16_s{stamp}1_e{stamp}9_c{stamp}9.nc",
        bucket.remote_prefix(PRODUCT)
    )
}

/// The six 10-minute band-13 scans of an hour
pub fn full_hour(bucket: TimeBucket) -> Vec<String> {
    (0..6).map(|i| scan_key(bucket, i * 10, 13)).collect()
}

/// Config rooted in `root`, starting 2024-11-25 12:00 (day 330)
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.root_folder = Some(root.to_path_buf());
    config.download.start_date = Some(today());
    config.download.start_hour = "12:00".to_string();
    config
}

/// Scripted override for the next listing call
#[derive(Debug, Clone)]
pub enum ListScript {
    Fail,
    Empty,
}

/// In-memory remote store
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    vanishing: Mutex<HashSet<String>>,
    scripts: Mutex<VecDeque<ListScript>>,
    list_calls: Mutex<HashMap<TimeBucket, usize>>,
    fetch_calls: Mutex<HashMap<String, usize>>,
    probe_failures: AtomicUsize,
    fetch_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, key: &str, body: &[u8]) {
        self.objects.lock().unwrap().insert(key.to_string(), body.to_vec());
    }

    pub fn publish_all(&self, keys: &[String]) {
        for key in keys {
            self.publish(key, b"scan-bytes");
        }
    }

    /// Fetches of `key` write a partial body then fail at the transport level
    pub fn fail_fetch(&self, key: &str) {
        self.failing.lock().unwrap().insert(key.to_string());
    }

    /// Fetches of `key` report success without leaving a file behind
    pub fn vanish_fetch(&self, key: &str) {
        self.vanishing.lock().unwrap().insert(key.to_string());
    }

    pub fn script(&self, steps: impl IntoIterator<Item = ListScript>) {
        self.scripts.lock().unwrap().extend(steps);
    }

    pub fn fail_probes(&self, n: usize) {
        self.probe_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub fn list_calls(&self, bucket: TimeBucket) -> usize {
        self.list_calls.lock().unwrap().get(&bucket).copied().unwrap_or(0)
    }

    pub fn fetch_calls(&self, key: &str) -> usize {
        self.fetch_calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn total_fetch_calls(&self) -> usize {
        self.fetch_calls.lock().unwrap().values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn probe(&self) -> Result<(), RemoteError> {
        let remaining = self.probe_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.probe_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RemoteError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    async fn list(&self, bucket: &TimeBucket) -> Result<Vec<RemoteObjectKey>, RemoteError> {
        *self.list_calls.lock().unwrap().entry(*bucket).or_default() += 1;

        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(ListScript::Fail) => {
                return Err(RemoteError::Transport("listing timed out".to_string()))
            }
            Some(ListScript::Empty) => return Ok(Vec::new()),
            None => {}
        }

        let prefix = bucket.remote_prefix(PRODUCT);
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .map(|k| RemoteObjectKey::new(k.clone()))
            .collect())
    }

    async fn fetch(&self, key: &RemoteObjectKey, dest: &Path) -> Result<u64, RemoteError> {
        *self
            .fetch_calls
            .lock()
            .unwrap()
            .entry(key.as_str().to_string())
            .or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self.failing.lock().unwrap().contains(key.as_str());
        let vanishing = self.vanishing.lock().unwrap().contains(key.as_str());
        let body = self.objects.lock().unwrap().get(key.as_str()).cloned();
        let result = if failing {
            tokio::fs::write(dest, b"par").await?;
            Err(RemoteError::Transport("connection reset".to_string()))
        } else if vanishing {
            tokio::fs::write(dest, b"gone").await?;
            tokio::fs::remove_file(dest).await?;
            Ok(4)
        } else {
            match body {
                Some(body) => {
                    tokio::fs::write(dest, &body).await?;
                    Ok(body.len() as u64)
                }
                None => Err(RemoteError::Status {
                    status: 404,
                    url: key.to_string(),
                }),
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
