//! Frame preprocessing: scan file → calibrated crop → threshold mask
//!
//! Every failure here is local to one frame. The caller logs it and moves
//! on to the next inbox file.

use crate::calibration::Calibration;
use crate::decoder::ScanDecoder;
use crate::error::PreprocessError;
use crate::frame::{CalibratedFrame, FrameMeta, ScanHeader, ThresholdMask};
use crate::grid::ReferenceGrid;
use ctp_common::config::{AccumulationConfig, GeoBounds};
use ctp_common::scan_name::{ScanName, SCAN_EXTENSION};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Preprocessing parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreprocessSettings {
    pub bounds: GeoBounds,
    pub threshold_celsius: f32,
    pub thermal_band_min: u8,
}

impl PreprocessSettings {
    pub fn from_config(config: &AccumulationConfig) -> ctp_common::Result<Self> {
        Ok(Self {
            bounds: config.crop_bounds()?,
            threshold_celsius: config.threshold_celsius,
            thermal_band_min: config.thermal_band_min,
        })
    }
}

pub struct Preprocessor {
    grid: ReferenceGrid,
    decoder: Arc<dyn ScanDecoder>,
    settings: PreprocessSettings,
}

impl Preprocessor {
    pub fn new(grid: ReferenceGrid, decoder: Arc<dyn ScanDecoder>, settings: PreprocessSettings) -> Self {
        Self {
            grid,
            decoder,
            settings,
        }
    }

    pub fn settings(&self) -> &PreprocessSettings {
        &self.settings
    }

    /// Decode, crop and calibrate one scan
    ///
    /// Thermal bands come out as brightness temperature in °C, reflective
    /// bands as reflectance factor.
    pub async fn calibrate(&self, path: &Path) -> Result<CalibratedFrame, PreprocessError> {
        let header = self.read_header(path).await?;
        self.calibrate_with(path, header).await
    }

    /// Full pipeline: calibrated frame thresholded into a mask
    ///
    /// Only thermal bands can be thresholded in °C; others are rejected
    /// before any radiance is read.
    pub async fn process(&self, path: &Path) -> Result<ThresholdMask, PreprocessError> {
        let header = self.read_header(path).await?;
        if header.band < self.settings.thermal_band_min {
            return Err(PreprocessError::NonThermalBand {
                band: header.band,
                min: self.settings.thermal_band_min,
            });
        }
        let frame = self.calibrate_with(path, header).await?;
        Ok(ThresholdMask::from_frame(&frame, self.settings.threshold_celsius))
    }

    async fn read_header(&self, path: &Path) -> Result<ScanHeader, PreprocessError> {
        validate_file(path).await?;
        Ok(self.decoder.header(path).await?)
    }

    async fn calibrate_with(&self, path: &Path, header: ScanHeader) -> Result<CalibratedFrame, PreprocessError> {
        let native_km = header.resolution_km().ok_or_else(|| PreprocessError::InvalidFile {
            path: path.display().to_string(),
            reason: format!("unreadable spatial resolution {:?}", header.spatial_resolution),
        })?;

        let window = self.grid.align(&self.settings.bounds, native_km, header.shape())?;
        let extent = header.extent(&window).ok_or_else(|| PreprocessError::InvalidFile {
            path: path.display().to_string(),
            reason: "scan-angle vectors shorter than the raster".to_string(),
        })?;
        let calibration = Calibration::for_header(&header, self.settings.thermal_band_min)?;

        let radiance = self.decoder.read_radiance(path, &window).await?;
        if radiance.dim() != window.shape() {
            return Err(PreprocessError::InvalidFile {
                path: path.display().to_string(),
                reason: format!(
                    "decoder returned {:?}, window is {:?}",
                    radiance.dim(),
                    window.shape()
                ),
            });
        }

        debug!(
            path = %path.display(),
            band = header.band,
            resolution_km = native_km,
            window = ?window,
            "Frame decoded"
        );

        Ok(CalibratedFrame {
            values: calibration.apply(&radiance),
            meta: FrameMeta {
                band: header.band,
                captured_at: header.time_coverage_start,
                resolution_km: native_km,
                window,
                extent,
                projection: header.projection,
                source: path.display().to_string(),
            },
        })
    }
}

/// File must exist, carry a scan name and be non-empty
async fn validate_file(path: &Path) -> Result<(), PreprocessError> {
    let invalid = |reason: String| PreprocessError::InvalidFile {
        path: path.display().to_string(),
        reason,
    };

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| invalid("no file name".to_string()))?;
    if !name.ends_with(SCAN_EXTENSION) {
        return Err(invalid(format!("not a {SCAN_EXTENSION} file")));
    }
    ScanName::parse(name).map_err(|e| invalid(e.to_string()))?;

    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    if !meta.is_file() || meta.len() == 0 {
        return Err(invalid("empty or not a regular file".to_string()));
    }
    Ok(())
}
