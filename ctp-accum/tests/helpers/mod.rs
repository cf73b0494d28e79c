//! Shared fixtures for ctp-accum integration tests
//!
//! A synthetic 10x10 reference grid at 8 km (lon = -100 + 5*col,
//! lat = -5*row) over a 40x40 native raster at 2 km. The test region
//! lon -90..-70, lat -30..-10 maps to native rows/cols 8..24.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use ctp_accum::frame::Projection;
use ctp_accum::snapshot::SnapshotExporter;
use ctp_accum::{
    AccumulationService, AccumulationWindow, DecodeError, PixelWindow, PreprocessSettings,
    Preprocessor, ReferenceGrid, ScanDecoder, ScanHeader,
};
use ctp_common::config::GeoBounds;
use ctp_common::ScanName;
use ndarray::{s, Array2};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const NATIVE: usize = 40;
pub const WINDOW: usize = 16;
pub const OFFSET: usize = 8;
pub const THRESHOLD: f32 = -53.0;

pub const FK1: f64 = 10803.3;
pub const FK2: f64 = 1392.74;
pub const BC1: f64 = 0.07550;
pub const BC2: f64 = 0.99975;

pub fn region() -> GeoBounds {
    GeoBounds {
        lon_west: -90.0,
        lon_east: -70.0,
        lat_south: -30.0,
        lat_north: -10.0,
    }
}

pub fn grid() -> ReferenceGrid {
    let lons = Array2::from_shape_fn((10, 10), |(_, c)| -100.0 + 5.0 * c as f64);
    let lats = Array2::from_shape_fn((10, 10), |(r, _)| -5.0 * r as f64);
    ReferenceGrid::new(lons, lats, 8.0).unwrap()
}

pub fn settings() -> PreprocessSettings {
    PreprocessSettings {
        bounds: region(),
        threshold_celsius: THRESHOLD,
        thermal_band_min: 7,
    }
}

pub fn expected_window() -> PixelWindow {
    PixelWindow {
        row0: OFFSET,
        row1: OFFSET + WINDOW,
        col0: OFFSET,
        col1: OFFSET + WINDOW,
    }
}

/// Radiance that calibrates to `celsius` with the band 13 coefficients
pub fn radiance_for(celsius: f64) -> f32 {
    let t_eff = (celsius + 273.15) * BC2 + BC1;
    (FK1 / ((FK2 / t_eff).exp() - 1.0)) as f32
}

/// Full native raster: warm everywhere, cold at the given window-relative pixels
pub fn scene(cold: &[(usize, usize)]) -> Array2<f32> {
    let mut raster = Array2::from_elem((NATIVE, NATIVE), radiance_for(20.0));
    for &(r, c) in cold {
        raster[[OFFSET + r, OFFSET + c]] = radiance_for(-70.0);
    }
    raster
}

/// Scan file name for 2024 day 330, 12:`minute`:20
pub fn scan_name(minute: u32, band: u8) -> String {
    format!(
        "OR_ABI-L1b-RadF-M6C{band:02}_G16_s202433012{minute:02}205_e202433012{minute:02}599_c202433012{minute:02}599.nc"
    )
}

/// Create a non-empty scan file in `dir`
pub fn write_scan(dir: &Path, minute: u32, band: u8) -> PathBuf {
    let path = dir.join(scan_name(minute, band));
    std::fs::write(&path, b"scan").unwrap();
    path
}

pub fn capture_date() -> NaiveDate {
    NaiveDate::from_yo_opt(2024, 330).unwrap()
}

/// Decoder serving headers derived from the file name and scripted rasters
#[derive(Default)]
pub struct ScriptedDecoder {
    rasters: Mutex<HashMap<String, Array2<f32>>>,
    resolutions: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    header_calls: AtomicUsize,
    radiance_calls: AtomicUsize,
}

impl ScriptedDecoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `raster` for the file named `name`
    pub fn script(&self, name: &str, raster: Array2<f32>) {
        self.rasters.lock().unwrap().insert(name.to_string(), raster);
    }

    /// Report a different native resolution (raster must match it)
    pub fn script_resolution(&self, name: &str, resolution: &str, raster: Array2<f32>) {
        self.resolutions
            .lock()
            .unwrap()
            .insert(name.to_string(), resolution.to_string());
        self.script(name, raster);
    }

    pub fn fail(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn header_calls(&self) -> usize {
        self.header_calls.load(Ordering::SeqCst)
    }

    pub fn radiance_calls(&self) -> usize {
        self.radiance_calls.load(Ordering::SeqCst)
    }

    fn name_of(path: &Path) -> String {
        path.file_name().unwrap().to_string_lossy().into_owned()
    }

    fn raster(&self, name: &str) -> Array2<f32> {
        self.rasters
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_else(|| scene(&[]))
    }
}

#[async_trait]
impl ScanDecoder for ScriptedDecoder {
    async fn header(&self, scan: &Path) -> Result<ScanHeader, DecodeError> {
        self.header_calls.fetch_add(1, Ordering::SeqCst);
        let name = Self::name_of(scan);
        if self.failing.lock().unwrap().contains(&name) {
            return Err(DecodeError::DecoderFailed(format!("{name}: corrupt")));
        }

        let parsed = ScanName::parse(&name).map_err(|e| DecodeError::ParseError(e.to_string()))?;
        let (rows, cols) = self.raster(&name).dim();
        let resolution = self
            .resolutions
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or_else(|| "2km at nadir".to_string());

        Ok(ScanHeader {
            band: parsed.band,
            spatial_resolution: resolution,
            rows,
            cols,
            time_coverage_start: parsed.scan_start.and_utc(),
            projection: Projection {
                perspective_point_height: 35_786_023.0,
                longitude_of_projection_origin: -75.0,
            },
            x: (0..cols).map(|c| -0.15 + 0.3 * c as f64 / cols as f64).collect(),
            y: (0..rows).map(|r| 0.15 - 0.3 * r as f64 / rows as f64).collect(),
            planck_fk1: Some(FK1),
            planck_fk2: Some(FK2),
            planck_bc1: Some(BC1),
            planck_bc2: Some(BC2),
            kappa0: Some(0.0018),
        })
    }

    async fn read_radiance(&self, scan: &Path, window: &PixelWindow) -> Result<Array2<f32>, DecodeError> {
        self.radiance_calls.fetch_add(1, Ordering::SeqCst);
        let raster = self.raster(&Self::name_of(scan));
        Ok(raster
            .slice(s![window.row0..window.row1, window.col0..window.col1])
            .to_owned())
    }
}

pub fn preprocessor(decoder: Arc<ScriptedDecoder>) -> Preprocessor {
    Preprocessor::new(grid(), decoder, settings())
}

/// Service over a window of `capacity` frames (10-minute cadence), exporting into `workdir`
pub fn service(decoder: Arc<ScriptedDecoder>, capacity: usize, workdir: &Path) -> AccumulationService {
    let window = AccumulationWindow::new(capacity, 10.0 / 60.0).shared();
    AccumulationService::new(preprocessor(decoder), window, SnapshotExporter::new(workdir))
}
