//! Time source for the scheduler
//!
//! Production sleeps on the tokio timer; tests use [`ManualClock`], which
//! records every requested wait and returns immediately.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::sync::Mutex;
use std::time::Duration;

#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);

    /// Current UTC date, used when no start date is configured
    fn today(&self) -> NaiveDate;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

/// Clock that never blocks
#[derive(Debug)]
pub struct ManualClock {
    today: NaiveDate,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today,
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Every wait requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().into_iter().sum()
    }
}

#[async_trait]
impl Clock for ManualClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(duration);
        tokio::task::yield_now().await;
    }

    fn today(&self) -> NaiveDate {
        self.today
    }
}
