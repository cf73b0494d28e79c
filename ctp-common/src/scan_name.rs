//! Scan file name parsing
//!
//! Scan files follow a fixed naming pattern:
//!
//! ```text
//! OR_ABI-L1b-RadF-M6C13_G16_s20243301200211_e20243301209519_c20243301209575.nc
//!    |product     |mode|band |sat |scan start (YYYYJJJHHMMSSt)
//! ```
//!
//! Band and scan start are recovered by position; nothing is read from the
//! file itself.

use crate::{Error, Result, TimeBucket};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// File name suffix of scan files
pub const SCAN_EXTENSION: &str = ".nc";

/// Fields recovered from a scan file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanName {
    pub file_name: String,
    /// e.g. `ABI-L1b-RadF`
    pub product: String,
    /// Scan mode number (`M6` → 6)
    pub mode: u8,
    pub band: u8,
    /// e.g. `G16`
    pub satellite: String,
    pub scan_start: NaiveDateTime,
}

impl ScanName {
    /// Parse a bare file name or a full object key (anything after the last `/`)
    pub fn parse(name_or_key: &str) -> Result<Self> {
        let file_name = name_or_key.rsplit('/').next().unwrap_or(name_or_key);
        let invalid = |why: &str| Error::InvalidInput(format!("{file_name}: {why}"));

        let stem = file_name
            .strip_suffix(SCAN_EXTENSION)
            .ok_or_else(|| invalid("not a .nc scan file"))?;

        let parts: Vec<&str> = stem.split('_').collect();
        if parts.len() < 4 || parts[0] != "OR" {
            return Err(invalid("unexpected name layout"));
        }

        // "ABI-L1b-RadF-M6C13"
        let (product, mode_band) = parts[1]
            .rsplit_once("-M")
            .ok_or_else(|| invalid("missing scan mode"))?;
        let (mode, band) = mode_band
            .split_once('C')
            .ok_or_else(|| invalid("missing band"))?;
        let mode: u8 = mode.parse().map_err(|_| invalid("bad scan mode"))?;
        let band: u8 = band.parse().map_err(|_| invalid("bad band number"))?;

        let start = parts[3]
            .strip_prefix('s')
            .ok_or_else(|| invalid("missing scan start"))?;
        let scan_start = parse_stamp(start).ok_or_else(|| invalid("bad scan start stamp"))?;

        Ok(Self {
            file_name: file_name.to_string(),
            product: product.to_string(),
            mode,
            band,
            satellite: parts[2].to_string(),
            scan_start,
        })
    }

    /// Hour bucket the scan belongs to
    pub fn bucket(&self) -> TimeBucket {
        TimeBucket::containing(self.scan_start)
    }
}

/// `YYYYJJJHHMMSS` followed by an optional tenths digit
fn parse_stamp(stamp: &str) -> Option<NaiveDateTime> {
    if stamp.len() < 13 || !stamp.is_ascii() {
        return None;
    }
    let year: i32 = stamp[0..4].parse().ok()?;
    let doy: u32 = stamp[4..7].parse().ok()?;
    let hour: u32 = stamp[7..9].parse().ok()?;
    let minute: u32 = stamp[9..11].parse().ok()?;
    let second: u32 = stamp[11..13].parse().ok()?;
    let date = NaiveDate::from_yo_opt(year, doy)?;
    let time = NaiveTime::from_hms_opt(hour, minute, second)?;
    Some(date.and_time(time))
}

/// Band number of a scan file name, if it parses
pub fn band_of(name_or_key: &str) -> Option<u8> {
    ScanName::parse(name_or_key).ok().map(|s| s.band)
}
