//! Retry/backoff policy for the ingestion scheduler
//!
//! A pure state transition: given the current counters and what just
//! happened, decide how long to wait and what the counters become. No
//! clocks, no I/O.

use ctp_common::config::DownloadConfig;
use serde::Serialize;
use std::time::Duration;

/// Counters carried between polls of one bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryState {
    /// Consecutive listings that returned nothing for the bucket
    pub consecutive_empty: u32,
    /// Last wait decided
    pub backoff: Duration,
    /// Wait accrued on the current bucket since the last stall warning
    pub elapsed: Duration,
}

/// What the scheduler observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    /// Listing succeeded but held no matching objects
    EmptyListing,
    /// Objects were dispatched but the bucket is still short
    BucketIncomplete,
    /// Listing or probe failed at the transport level
    TransportError,
    /// Bucket reached its expected count
    BucketComplete,
}

/// Outcome of one policy step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub wait: Duration,
    /// The empty-listing threshold was hit and the longer wait applies
    pub escalated: bool,
    /// Elapsed time on this bucket crossed the ceiling and was reset
    pub stalled: bool,
}

/// Tunables, normally taken from `[download]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub poll_timeout: Duration,
    pub max_wait: Duration,
    pub empty_threshold: u32,
    pub reconnect_interval: Duration,
    pub elapsed_ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            poll_timeout: Duration::from_secs(config.poll_timeout_secs),
            max_wait: Duration::from_secs(config.max_wait_secs),
            empty_threshold: config.empty_listing_threshold.max(1),
            reconnect_interval: Duration::from_secs(config.reconnect_interval_secs),
            elapsed_ceiling: Duration::from_secs(config.bucket_wait_ceiling_secs),
        }
    }

    /// Escalated wait after `empty_threshold` empty listings in a row
    pub fn escalated_wait(&self) -> Duration {
        (self.poll_timeout * 2).min(self.max_wait)
    }

    /// Apply `event` to `state`
    pub fn apply(&self, state: &RetryState, event: RetryEvent) -> (RetryState, RetryDecision) {
        let mut next = *state;
        let mut decision = RetryDecision {
            wait: Duration::ZERO,
            escalated: false,
            stalled: false,
        };

        match event {
            RetryEvent::BucketComplete => {
                next = RetryState::default();
            }
            RetryEvent::TransportError => {
                decision.wait = self.reconnect_interval;
            }
            RetryEvent::EmptyListing => {
                next.consecutive_empty += 1;
                if next.consecutive_empty >= self.empty_threshold {
                    next.consecutive_empty = 0;
                    decision.wait = self.escalated_wait();
                    decision.escalated = true;
                } else {
                    decision.wait = self.poll_timeout;
                    self.accrue(&mut next, &mut decision);
                }
            }
            RetryEvent::BucketIncomplete => {
                next.consecutive_empty = 0;
                decision.wait = self.poll_timeout;
                self.accrue(&mut next, &mut decision);
            }
        }

        next.backoff = decision.wait;
        (next, decision)
    }

    fn accrue(&self, state: &mut RetryState, decision: &mut RetryDecision) {
        state.elapsed += decision.wait;
        if state.elapsed > self.elapsed_ceiling {
            state.elapsed = Duration::ZERO;
            decision.stalled = true;
        }
    }
}
