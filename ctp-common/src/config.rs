//! Configuration loading and validation
//!
//! Both services read the same TOML file. Resolution order for the file:
//! 1. Command-line argument / `CTP_CONFIG` (handled by each binary's clap args)
//! 2. `~/.config/ctp/config.toml`
//! 3. Compiled defaults (logged as a warning, never fatal)
//!
//! Relative paths inside the file resolve against `root_folder`, which
//! defaults to the config file's directory.

use crate::time::parse_date_hour;
use crate::{Error, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "CTP_CONFIG";

/// Top-level configuration shared by `ctp-ingest` and `ctp-accum`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for relative paths
    pub root_folder: Option<PathBuf>,
    pub remote: RemoteConfig,
    pub download: DownloadConfig,
    pub accumulation: AccumulationConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Remote object store settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Bucket endpoint, virtual-hosted style
    pub base_url: String,
    /// Top-level prefix of the product, e.g. `ABI-L1b-RadF`
    pub product: String,
    /// Per-request timeout for listings and downloads
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://noaa-goes16.s3.amazonaws.com".to_string(),
            product: "ABI-L1b-RadF".to_string(),
            request_timeout_secs: 120,
        }
    }
}

/// Ingestion scheduling and retry settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Bands to fetch; everything else in a listing is skipped
    pub bands: Vec<u8>,
    /// Scans published per hour per band (10-minute cadence → 6)
    pub scans_per_hour: u32,
    /// Wait between listings while a bucket is incomplete
    pub poll_timeout_secs: u64,
    /// Cap on the escalated wait after repeated empty listings
    pub max_wait_secs: u64,
    /// Consecutive empty listings before escalating
    pub empty_listing_threshold: u32,
    /// Wait after a transport failure (listing or startup probe)
    pub reconnect_interval_secs: u64,
    /// Cumulative wait on one bucket before a stall warning
    pub bucket_wait_ceiling_secs: u64,
    /// Parallel downloads
    pub max_workers: usize,
    /// First day to ingest when the ledger holds no completed bucket (default: today, UTC)
    pub start_date: Option<NaiveDate>,
    /// `HH:MM` on `start_date`
    pub start_hour: String,
    /// Last day to ingest; absent means run indefinitely
    pub end_date: Option<NaiveDate>,
    /// `HH:MM` on `end_date` (default `23:59`)
    pub end_hour: Option<String>,
    pub inbox_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub ledger_path: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            bands: vec![13],
            scans_per_hour: 6,
            poll_timeout_secs: 60,
            max_wait_secs: 1800,
            empty_listing_threshold: 5,
            reconnect_interval_secs: 60,
            bucket_wait_ceiling_secs: 600,
            max_workers: 1,
            start_date: None,
            start_hour: "00:00".to_string(),
            end_date: None,
            end_hour: None,
            inbox_dir: PathBuf::from("inbox"),
            temp_dir: PathBuf::from("temp"),
            ledger_path: PathBuf::from("download_db.json"),
        }
    }
}

impl DownloadConfig {
    /// Objects a bucket must hold to count as complete
    pub fn expected_per_bucket(&self) -> usize {
        self.bands.len() * self.scans_per_hour as usize
    }

    /// Start instant; falls back to `today` when no start date is configured
    pub fn start_instant(&self, today: NaiveDate) -> Result<NaiveDateTime> {
        parse_date_hour(self.start_date.unwrap_or(today), &self.start_hour)
    }

    /// End instant, if the run is bounded
    pub fn end_instant(&self) -> Result<Option<NaiveDateTime>> {
        match self.end_date {
            Some(date) => {
                let hour = self.end_hour.as_deref().unwrap_or("23:59");
                parse_date_hour(date, hour).map(Some)
            }
            None => Ok(None),
        }
    }
}

/// Named crop regions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    #[default]
    Argentina,
    SouthAmerica,
    /// Uses `accumulation.custom_extent`
    Custom,
}

/// Geographic bounding box in degrees
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct GeoBounds {
    pub lon_west: f64,
    pub lon_east: f64,
    pub lat_south: f64,
    pub lat_north: f64,
}

impl GeoBounds {
    pub const ARGENTINA: GeoBounds = GeoBounds {
        lon_west: -90.0,
        lon_east: -40.5,
        lat_south: -55.5,
        lat_north: -15.5,
    };

    pub const SOUTH_AMERICA: GeoBounds = GeoBounds {
        lon_west: -100.0,
        lon_east: -30.0,
        lat_south: -60.0,
        lat_north: -5.0,
    };

    /// Grow (or shrink) each edge by the given padding
    pub fn padded(&self, pad: &ExtentPadding) -> GeoBounds {
        GeoBounds {
            lon_west: self.lon_west + pad.lon_west,
            lon_east: self.lon_east + pad.lon_east,
            lat_south: self.lat_south + pad.lat_south,
            lat_north: self.lat_north + pad.lat_north,
        }
    }
}

/// Offsets added to each edge of the region before cropping
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtentPadding {
    pub lon_west: f64,
    pub lon_east: f64,
    pub lat_south: f64,
    pub lat_north: f64,
}

impl Default for ExtentPadding {
    fn default() -> Self {
        Self {
            lon_west: -5.0,
            lon_east: 0.0,
            lat_south: -5.0,
            lat_north: 4.0,
        }
    }
}

/// How the accumulation service learns about new inbox files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Filesystem notifications
    #[default]
    Watch,
    /// Periodic directory scan
    Poll,
}

/// Accumulation engine settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AccumulationConfig {
    /// Frames kept in the trailing window (144 × 10 min = 24 h)
    pub window_size: usize,
    /// Inbox files used for the cold-start bootstrap
    pub initial_frames: usize,
    /// Cloud-top brightness-temperature threshold
    pub threshold_celsius: f32,
    /// Minutes represented by one frame
    pub cadence_minutes: u32,
    /// Lowest band id treated as thermal (emissive)
    pub thermal_band_min: u8,
    pub region: Region,
    pub custom_extent: Option<GeoBounds>,
    pub extent_padding: ExtentPadding,
    /// Reference longitude grid (whitespace-separated rows)
    pub reference_lons: PathBuf,
    pub reference_lats: PathBuf,
    pub reference_resolution_km: f64,
    /// Snapshot export directory
    pub workdir: PathBuf,
    pub trigger: TriggerMode,
    pub inbox_poll_secs: u64,
    /// Poll interval while waiting for the initial frames
    pub startup_poll_secs: u64,
    /// External scan decoder program
    pub decoder_command: String,
    /// Arguments placed before the decoder subcommand
    pub decoder_args: Vec<String>,
}

impl Default for AccumulationConfig {
    fn default() -> Self {
        Self {
            window_size: 144,
            initial_frames: 6,
            threshold_celsius: -53.0,
            cadence_minutes: 10,
            thermal_band_min: 7,
            region: Region::Argentina,
            custom_extent: None,
            extent_padding: ExtentPadding::default(),
            reference_lons: PathBuf::from("grids/g16_lons_8km.txt"),
            reference_lats: PathBuf::from("grids/g16_lats_8km.txt"),
            reference_resolution_km: 8.0,
            workdir: PathBuf::from("accum"),
            trigger: TriggerMode::Watch,
            inbox_poll_secs: 5,
            startup_poll_secs: 30,
            decoder_command: "ctp-scan-decoder".to_string(),
            decoder_args: Vec::new(),
        }
    }
}

impl AccumulationConfig {
    /// Region bounds before padding
    pub fn region_bounds(&self) -> Result<GeoBounds> {
        match self.region {
            Region::Argentina => Ok(GeoBounds::ARGENTINA),
            Region::SouthAmerica => Ok(GeoBounds::SOUTH_AMERICA),
            Region::Custom => self.custom_extent.ok_or_else(|| {
                Error::Config("region = \"custom\" requires accumulation.custom_extent".to_string())
            }),
        }
    }

    /// Bounds actually cropped: region plus padding
    pub fn crop_bounds(&self) -> Result<GeoBounds> {
        Ok(self.region_bounds()?.padded(&self.extent_padding))
    }

    /// Hours represented by one frame
    pub fn hours_per_frame(&self) -> f32 {
        self.cadence_minutes as f32 / 60.0
    }
}

/// HTTP status endpoints
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub ingest_bind: String,
    pub accum_bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ingest_bind: "127.0.0.1:5830".to_string(),
            accum_bind: "127.0.0.1:5831".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr only if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Parse TOML text; relative paths resolve against `base_dir` unless `root_folder` is set
    pub fn from_toml_str(text: &str, base_dir: Option<&Path>) -> Result<Self> {
        let mut config: Config =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;
        if config.root_folder.is_none() {
            config.root_folder = base_dir.map(Path::to_path_buf);
        }
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text, path.parent())
    }

    /// Config file that [`Config::load`] would read, if any
    pub fn locate(cli_path: Option<&Path>) -> Option<PathBuf> {
        match cli_path {
            Some(path) => Some(path.to_path_buf()),
            None => user_config_path().filter(|p| p.exists()),
        }
    }

    /// Resolve and load the config: explicit path, then user config dir, then defaults
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = Self::locate(cli_path) {
            info!(path = %path.display(), "Loading configuration");
            return Self::from_file(&path);
        }

        warn!("No configuration file found, using compiled defaults");
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let d = &self.download;
        if d.bands.is_empty() {
            return Err(Error::Config("download.bands must not be empty".to_string()));
        }
        if let Some(b) = d.bands.iter().find(|b| !(1..=16).contains(*b)) {
            return Err(Error::Config(format!("download.bands: no such band {b}")));
        }
        if d.scans_per_hour == 0 {
            return Err(Error::Config("download.scans_per_hour must be > 0".to_string()));
        }
        if d.max_workers == 0 {
            return Err(Error::Config("download.max_workers must be >= 1".to_string()));
        }
        if d.empty_listing_threshold == 0 {
            return Err(Error::Config(
                "download.empty_listing_threshold must be >= 1".to_string(),
            ));
        }
        parse_date_hour(NaiveDate::MIN, &d.start_hour)?;
        if let (Some(start), Some(end)) = (d.start_date, d.end_instant()?) {
            if end < parse_date_hour(start, &d.start_hour)? {
                return Err(Error::Config("download end precedes start".to_string()));
            }
        }

        let a = &self.accumulation;
        if a.window_size == 0 {
            return Err(Error::Config("accumulation.window_size must be >= 1".to_string()));
        }
        if a.initial_frames > a.window_size {
            return Err(Error::Config(format!(
                "accumulation.initial_frames ({}) exceeds window_size ({})",
                a.initial_frames, a.window_size
            )));
        }
        if a.cadence_minutes == 0 {
            return Err(Error::Config("accumulation.cadence_minutes must be > 0".to_string()));
        }
        if a.reference_resolution_km <= 0.0 {
            return Err(Error::Config(
                "accumulation.reference_resolution_km must be > 0".to_string(),
            ));
        }
        a.region_bounds()?;
        Ok(())
    }

    /// Base directory for relative paths
    pub fn root(&self) -> PathBuf {
        self.root_folder.clone().unwrap_or_else(default_root_folder)
    }

    /// Join `path` onto the root unless it is already absolute
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root().join(path)
        }
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.resolve(&self.download.inbox_dir)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.resolve(&self.download.temp_dir)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.resolve(&self.download.ledger_path)
    }

    pub fn workdir(&self) -> PathBuf {
        self.resolve(&self.accumulation.workdir)
    }
}

/// `~/.config/ctp/config.toml` (platform equivalent elsewhere)
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("ctp").join("config.toml"))
}

/// OS-dependent default data folder
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("ctp"))
        .unwrap_or_else(|| PathBuf::from("./ctp_data"))
}
