//! Scan header, calibrated frame and threshold mask types

use crate::grid::PixelWindow;
use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Geostationary projection parameters of a scan
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Projection {
    /// Satellite height above the ellipsoid, metres
    pub perspective_point_height: f64,
    pub longitude_of_projection_origin: f64,
}

/// Scan metadata as reported by the decoder (`<cmd> header <scan>`)
///
/// Field names follow the attribute and variable names of the scan files.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScanHeader {
    pub band: u8,
    /// e.g. `"2km at nadir"`
    pub spatial_resolution: String,
    pub rows: usize,
    pub cols: usize,
    pub time_coverage_start: DateTime<Utc>,
    pub projection: Projection,
    /// Scan angle per column, radians
    pub x: Vec<f64>,
    /// Scan angle per row, radians
    pub y: Vec<f64>,
    #[serde(default)]
    pub planck_fk1: Option<f64>,
    #[serde(default)]
    pub planck_fk2: Option<f64>,
    #[serde(default)]
    pub planck_bc1: Option<f64>,
    #[serde(default)]
    pub planck_bc2: Option<f64>,
    #[serde(default)]
    pub kappa0: Option<f64>,
}

impl ScanHeader {
    /// Native resolution in km, parsed from the leading number of
    /// `spatial_resolution`
    pub fn resolution_km(&self) -> Option<f64> {
        let text = self.spatial_resolution.trim();
        let end = text
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(text.len());
        text[..end].parse::<f64>().ok().filter(|km| *km > 0.0)
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Projected extent of `window` in metres
    ///
    /// Scan angles at the window edges scaled by the satellite height.
    pub fn extent(&self, window: &PixelWindow) -> Option<ImageExtent> {
        let h = self.projection.perspective_point_height;
        let x_first = *self.x.get(window.col0)?;
        let x_last = *self.x.get(window.col1.checked_sub(1)?)?;
        let y_first = *self.y.get(window.row0)?;
        let y_last = *self.y.get(window.row1.checked_sub(1)?)?;
        Some(ImageExtent {
            x_min: x_first.min(x_last) * h,
            x_max: x_first.max(x_last) * h,
            y_min: y_first.min(y_last) * h,
            y_max: y_first.max(y_last) * h,
        })
    }
}

/// Projected image extent in metres
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ImageExtent {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

/// Metadata carried from a scan through its mask into the snapshot
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FrameMeta {
    pub band: u8,
    pub captured_at: DateTime<Utc>,
    pub resolution_km: f64,
    pub window: PixelWindow,
    pub extent: ImageExtent,
    pub projection: Projection,
    /// Inbox file the frame was decoded from
    pub source: String,
}

/// Cropped physical values (°C or reflectance); NaN where invalid
#[derive(Debug, Clone)]
pub struct CalibratedFrame {
    pub values: Array2<f32>,
    pub meta: FrameMeta,
}

/// Binary cloud-top mask over the canonical window
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdMask {
    pub data: Array2<u8>,
    pub meta: FrameMeta,
}

impl ThresholdMask {
    /// `1` where the value is strictly below `threshold`, `0` elsewhere
    /// including NaN
    pub fn from_frame(frame: &CalibratedFrame, threshold: f32) -> Self {
        // NaN < threshold is false, so invalid pixels map to 0
        let data = frame.values.mapv(|v| u8::from(v < threshold));
        Self {
            data,
            meta: frame.meta.clone(),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.meta.captured_at
    }
}
