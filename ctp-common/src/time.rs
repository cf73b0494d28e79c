//! Hourly time buckets
//!
//! The remote archive partitions scans by `(year, day-of-year, hour)`. A
//! [`TimeBucket`] names one such partition and orders chronologically.

use crate::{Error, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::fmt;

/// One UTC hour of the archive, identified by year, ordinal day and hour
///
/// Internally holds the hour's start instant, so every value is a valid
/// calendar hour and the derived ordering is chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeBucket {
    start: NaiveDateTime,
}

impl TimeBucket {
    /// Build from components; day-of-year is 1-based and leap-year aware
    pub fn new(year: i32, day_of_year: u32, hour: u32) -> Result<Self> {
        let date = NaiveDate::from_yo_opt(year, day_of_year).ok_or_else(|| {
            Error::InvalidInput(format!("no day {day_of_year} in year {year}"))
        })?;
        let time = NaiveTime::from_hms_opt(hour, 0, 0)
            .ok_or_else(|| Error::InvalidInput(format!("hour {hour} out of range")))?;
        Ok(Self {
            start: date.and_time(time),
        })
    }

    /// Bucket containing `instant` (truncated to the hour)
    pub fn containing(instant: NaiveDateTime) -> Self {
        let start = instant.date().and_hms_opt(instant.hour(), 0, 0).unwrap_or(instant);
        Self { start }
    }

    /// Parse the three string keys used by the ledger file (`"2024"`, `"330"`, `"12"`)
    pub fn from_parts(year: &str, day_of_year: &str, hour: &str) -> Result<Self> {
        let parse = |label: &str, s: &str| -> Result<u32> {
            s.trim()
                .parse::<u32>()
                .map_err(|_| Error::InvalidInput(format!("bad {label} component: {s:?}")))
        };
        let year = parse("year", year)? as i32;
        Self::new(year, parse("day", day_of_year)?, parse("hour", hour)?)
    }

    pub fn year(&self) -> i32 {
        self.start.year()
    }

    pub fn day_of_year(&self) -> u32 {
        self.start.ordinal()
    }

    pub fn hour(&self) -> u32 {
        self.start.hour()
    }

    /// First instant covered by the bucket
    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    /// The following hour, rolling over day and year boundaries
    pub fn next(&self) -> Self {
        Self {
            start: self.start + Duration::hours(1),
        }
    }

    /// Zero-padded keys as stored in the ledger: `("2024", "330", "12")`
    pub fn ledger_parts(&self) -> (String, String, String) {
        (
            format!("{:04}", self.year()),
            format!("{:03}", self.day_of_year()),
            format!("{:02}", self.hour()),
        )
    }

    /// Listing prefix for this hour under `product`, e.g. `ABI-L1b-RadF/2024/330/12/`
    pub fn remote_prefix(&self, product: &str) -> String {
        format!(
            "{}/{:04}/{:03}/{:02}/",
            product.trim_matches('/'),
            self.year(),
            self.day_of_year(),
            self.hour()
        )
    }

    /// `YYYYJJJHH`, the leading part of a scan-start stamp falling in this hour
    pub fn scan_stamp(&self) -> String {
        format!(
            "{:04}{:03}{:02}",
            self.year(),
            self.day_of_year(),
            self.hour()
        )
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}/{:03}/{:02}",
            self.year(),
            self.day_of_year(),
            self.hour()
        )
    }
}

/// Combine a date and an `HH:MM` string into an instant
pub fn parse_date_hour(date: NaiveDate, hour_minute: &str) -> Result<NaiveDateTime> {
    let time = NaiveTime::parse_from_str(hour_minute.trim(), "%H:%M")
        .map_err(|e| Error::Config(format!("invalid hour {hour_minute:?}: {e}")))?;
    Ok(date.and_time(time))
}
