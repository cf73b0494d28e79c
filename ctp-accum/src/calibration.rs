//! Radiance to physical value conversion

use crate::error::PreprocessError;
use crate::frame::ScanHeader;
use ndarray::Array2;

const KELVIN_OFFSET: f64 = 273.15;

/// Planck coefficients of an emissive band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanckCoefficients {
    pub fk1: f64,
    pub fk2: f64,
    pub bc1: f64,
    pub bc2: f64,
}

impl PlanckCoefficients {
    pub fn from_header(header: &ScanHeader) -> Option<Self> {
        Some(Self {
            fk1: header.planck_fk1?,
            fk2: header.planck_fk2?,
            bc1: header.planck_bc1?,
            bc2: header.planck_bc2?,
        })
    }

    /// Brightness temperature in °C; NaN for non-positive or non-finite radiance
    pub fn brightness_celsius(&self, radiance: f32) -> f32 {
        let l = radiance as f64;
        if !l.is_finite() || l <= 0.0 {
            return f32::NAN;
        }
        let kelvin = (self.fk2 / (self.fk1 / l + 1.0).ln() - self.bc1) / self.bc2;
        (kelvin - KELVIN_OFFSET) as f32
    }
}

/// How a band's radiance becomes a physical value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Calibration {
    /// Emissive bands: brightness temperature
    Planck(PlanckCoefficients),
    /// Reflective bands: `kappa0 × L`
    Reflectance { kappa0: f64 },
}

impl Calibration {
    /// Pick the calibration for `header`'s band
    pub fn for_header(header: &ScanHeader, thermal_band_min: u8) -> Result<Self, PreprocessError> {
        if header.band >= thermal_band_min {
            PlanckCoefficients::from_header(header)
                .map(Calibration::Planck)
                .ok_or_else(|| {
                    PreprocessError::Calibration(format!(
                        "band {} header lacks Planck coefficients",
                        header.band
                    ))
                })
        } else {
            header
                .kappa0
                .map(|kappa0| Calibration::Reflectance { kappa0 })
                .ok_or_else(|| {
                    PreprocessError::Calibration(format!("band {} header lacks kappa0", header.band))
                })
        }
    }

    pub fn apply(&self, radiance: &Array2<f32>) -> Array2<f32> {
        match *self {
            Calibration::Planck(coeffs) => radiance.mapv(|l| coeffs.brightness_celsius(l)),
            Calibration::Reflectance { kappa0 } => radiance.mapv(|l| (kappa0 * l as f64) as f32),
        }
    }
}
