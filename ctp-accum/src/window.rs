//! Sliding-window accumulation of threshold masks
//!
//! Keeps the `capacity` most recently captured masks, ordered by capture
//! time, and their elementwise sum. Each insert adds the new mask and, once
//! full, subtracts the oldest, so the update cost is one pass over the
//! raster regardless of window length. The sum is integer, so repeated
//! add/evict never drifts.

use crate::frame::{FrameMeta, ThresholdMask};
use chrono::{DateTime, Utc};
use ndarray::{Array2, Zip};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Window shared between the producer and snapshot readers
pub type SharedWindow = Arc<RwLock<AccumulationWindow>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    /// Masks must share the window's shape; mixing shapes would corrupt
    /// the running sum
    #[error("mask shape {found:?} does not match window shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
}

/// Result of offering a mask to the window
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// Added at its capture-time position; `evicted` is the oldest mask
    /// pushed out to stay within capacity
    Inserted { evicted: Option<ThresholdMask> },
    /// A mask with the same capture time is already queued
    AlreadyPresent,
    /// Window is full and the mask is older than everything in it
    TooOld,
}

/// Point-in-time copy of the accumulated persistence
#[derive(Debug, Clone, Serialize)]
pub struct WindowSnapshot {
    /// Hours each pixel spent below the threshold within the window
    pub hours: Array2<f32>,
    pub frames: usize,
    pub capacity: usize,
    /// Metadata of the newest frame in the window
    pub latest: Option<FrameMeta>,
}

#[derive(Debug)]
pub struct AccumulationWindow {
    capacity: usize,
    masks: VecDeque<ThresholdMask>,
    sum: Option<Array2<u32>>,
    latest: Option<FrameMeta>,
    hours_per_frame: f32,
}

impl AccumulationWindow {
    pub fn new(capacity: usize, hours_per_frame: f32) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            masks: VecDeque::with_capacity(capacity),
            sum: None,
            latest: None,
            hours_per_frame,
        }
    }

    pub fn shared(self) -> SharedWindow {
        Arc::new(RwLock::new(self))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    pub fn shape(&self) -> Option<(usize, usize)> {
        self.sum.as_ref().map(|s| s.dim())
    }

    pub fn sum(&self) -> Option<&Array2<u32>> {
        self.sum.as_ref()
    }

    pub fn latest(&self) -> Option<&FrameMeta> {
        self.latest.as_ref()
    }

    /// Seed the window from the cold-start frames
    ///
    /// Returns how many masks were inserted. An empty seed leaves the
    /// window empty; the first [`insert`](Self::insert) initializes it.
    pub fn bootstrap(&mut self, masks: Vec<ThresholdMask>) -> Result<usize, WindowError> {
        if masks.is_empty() {
            warn!("No initial frames available, accumulation starts empty");
            return Ok(0);
        }
        let mut seeded = 0;
        for mask in masks {
            if let InsertOutcome::Inserted { .. } = self.insert(mask)? {
                seeded += 1;
            }
        }
        debug!(frames = seeded, "Window bootstrapped");
        Ok(seeded)
    }

    /// Add `mask` at its capture-time position
    ///
    /// Late arrivals are accepted as long as they are newer than the oldest
    /// queued mask; the queue stays sorted and the oldest mask is evicted
    /// when over capacity. A mismatched shape leaves the window untouched.
    pub fn insert(&mut self, mask: ThresholdMask) -> Result<InsertOutcome, WindowError> {
        if let Some(sum) = &self.sum {
            if sum.dim() != mask.shape() {
                return Err(WindowError::ShapeMismatch {
                    expected: sum.dim(),
                    found: mask.shape(),
                });
            }
        }

        let captured_at = mask.captured_at();
        let position = self.masks.partition_point(|m| m.captured_at() < captured_at);
        if self
            .masks
            .get(position)
            .is_some_and(|m| m.captured_at() == captured_at)
        {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        if position == 0 && self.masks.len() >= self.capacity {
            return Ok(InsertOutcome::TooOld);
        }

        let shape = mask.shape();
        let sum = self.sum.get_or_insert_with(|| Array2::zeros(shape));
        Zip::from(&mut *sum)
            .and(&mask.data)
            .for_each(|s, &m| *s += u32::from(m));
        self.masks.insert(position, mask);

        let evicted = if self.masks.len() > self.capacity {
            self.masks.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            Zip::from(&mut *sum)
                .and(&old.data)
                .for_each(|s, &m| *s -= u32::from(m));
        }

        self.latest = self.masks.back().map(|m| m.meta.clone());
        Ok(InsertOutcome::Inserted { evicted })
    }

    /// Capture time of the oldest queued mask
    pub fn oldest_capture(&self) -> Option<DateTime<Utc>> {
        self.masks.front().map(|m| m.captured_at())
    }

    pub fn snapshot(&self) -> Option<WindowSnapshot> {
        let sum = self.sum.as_ref()?;
        let hours_per_frame = self.hours_per_frame;
        Some(WindowSnapshot {
            hours: sum.mapv(|count| count as f32 * hours_per_frame),
            frames: self.masks.len(),
            capacity: self.capacity,
            latest: self.latest.clone(),
        })
    }
}
