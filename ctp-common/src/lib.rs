//! # CTP Common Library
//!
//! Shared code for the cloud-top persistence services:
//! - Error types
//! - Configuration loading (TOML + CLI/env overrides)
//! - Hourly time buckets used to partition the remote archive
//! - Scan file name parsing
//! - Tracing initialization
//! - Atomic file writes

pub mod config;
pub mod error;
pub mod fs;
pub mod logging;
pub mod scan_name;
pub mod time;

pub use config::Config;
pub use error::{Error, Result};
pub use scan_name::ScanName;
pub use time::TimeBucket;
