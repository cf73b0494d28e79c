//! Reference grid and pixel-window alignment
//!
//! Geographic bounds are mapped to a pixel window through a fixed
//! lon/lat lookup grid at a coarse reference resolution (8 km). The
//! nearest longitude is searched along the grid's central row and the
//! nearest latitude along its central column; the resulting indices are
//! then scaled by the integer ratio between reference and native
//! resolution. The window for a given (bounds, resolution) pair is
//! therefore always the same, which is what keeps masks from different
//! scans addable.

use ctp_common::config::GeoBounds;
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Tolerance when deciding whether the resolution ratio is an integer
const SCALE_EPSILON: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("cannot read grid file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("grid file {path}, line {line}: {message}")]
    Parse {
        path: String,
        line: usize,
        message: String,
    },

    #[error("grid shape mismatch: lons {lons:?}, lats {lats:?}")]
    ShapeMismatch {
        lons: (usize, usize),
        lats: (usize, usize),
    },

    #[error("grid is empty")]
    Empty,
}

/// The frame cannot be mapped to a usable window; it is dropped
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GridAlignmentError {
    #[error("{axis} {value} lies outside the reference grid coverage [{min}, {max}]")]
    OutsideGrid {
        axis: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("reference/native resolution ratio {ratio} is not a positive integer")]
    NonIntegerScale { ratio: f64 },

    #[error("bounds select an empty window ({rows} rows x {cols} cols)")]
    EmptyWindow { rows: i64, cols: i64 },

    #[error("window {window:?} exceeds native raster {rows}x{cols}")]
    ExceedsRaster {
        window: PixelWindow,
        rows: usize,
        cols: usize,
    },
}

/// Half-open pixel window `[row0, row1) x [col0, col1)` in native resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelWindow {
    pub row0: usize,
    pub row1: usize,
    pub col0: usize,
    pub col1: usize,
}

impl PixelWindow {
    pub fn rows(&self) -> usize {
        self.row1 - self.row0
    }

    pub fn cols(&self) -> usize {
        self.col1 - self.col0
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows(), self.cols())
    }
}

/// Lon/lat lookup grid at the reference resolution
#[derive(Debug, Clone)]
pub struct ReferenceGrid {
    lons: Array2<f64>,
    lats: Array2<f64>,
    resolution_km: f64,
}

impl ReferenceGrid {
    pub fn new(lons: Array2<f64>, lats: Array2<f64>, resolution_km: f64) -> Result<Self, GridError> {
        if lons.dim() != lats.dim() {
            return Err(GridError::ShapeMismatch {
                lons: lons.dim(),
                lats: lats.dim(),
            });
        }
        if lons.is_empty() {
            return Err(GridError::Empty);
        }
        Ok(Self {
            lons,
            lats,
            resolution_km,
        })
    }

    /// Load whitespace-separated text grids (one grid row per line)
    pub fn load(lons_path: &Path, lats_path: &Path, resolution_km: f64) -> Result<Self, GridError> {
        let lons = load_text_grid(lons_path)?;
        let lats = load_text_grid(lats_path)?;
        Self::new(lons, lats, resolution_km)
    }

    pub fn resolution_km(&self) -> f64 {
        self.resolution_km
    }

    pub fn shape(&self) -> (usize, usize) {
        self.lons.dim()
    }

    /// Pixel window covering `bounds` in a raster of `native_shape` at `native_km`
    pub fn align(
        &self,
        bounds: &GeoBounds,
        native_km: f64,
        native_shape: (usize, usize),
    ) -> Result<PixelWindow, GridAlignmentError> {
        let (rows, cols) = self.lons.dim();
        let lon_row = self.lons.row(rows / 2);
        let lat_col = self.lats.column(cols / 2);

        let col_west = nearest("longitude", lon_row, bounds.lon_west)?;
        let col_east = nearest("longitude", lon_row, bounds.lon_east)?;
        // Rows run north to south
        let row_north = nearest("latitude", lat_col, bounds.lat_north)?;
        let row_south = nearest("latitude", lat_col, bounds.lat_south)?;

        let scale = integer_scale(self.resolution_km, native_km)?;

        let rows_span = row_south as i64 - row_north as i64;
        let cols_span = col_east as i64 - col_west as i64;
        if rows_span <= 0 || cols_span <= 0 {
            return Err(GridAlignmentError::EmptyWindow {
                rows: rows_span * scale as i64,
                cols: cols_span * scale as i64,
            });
        }

        let window = PixelWindow {
            row0: row_north * scale,
            row1: row_south * scale,
            col0: col_west * scale,
            col1: col_east * scale,
        };

        let (native_rows, native_cols) = native_shape;
        if window.row1 > native_rows || window.col1 > native_cols {
            return Err(GridAlignmentError::ExceedsRaster {
                window,
                rows: native_rows,
                cols: native_cols,
            });
        }

        Ok(window)
    }
}

/// Index of the finite value closest to `target`
///
/// Targets beyond the finite range of the line are rejected rather than
/// snapped to the edge.
fn nearest(axis: &'static str, line: ArrayView1<'_, f64>, target: f64) -> Result<usize, GridAlignmentError> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut best: Option<(usize, f64)> = None;

    for (idx, &value) in line.iter().enumerate() {
        if !value.is_finite() {
            continue;
        }
        min = min.min(value);
        max = max.max(value);
        let distance = (value - target).abs();
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((idx, distance));
        }
    }

    match best {
        Some((idx, _)) if target >= min && target <= max => Ok(idx),
        _ => Err(GridAlignmentError::OutsideGrid {
            axis,
            value: target,
            min,
            max,
        }),
    }
}

fn integer_scale(reference_km: f64, native_km: f64) -> Result<usize, GridAlignmentError> {
    let ratio = reference_km / native_km;
    let rounded = ratio.round();
    if !ratio.is_finite() || rounded < 1.0 || (ratio - rounded).abs() > SCALE_EPSILON {
        return Err(GridAlignmentError::NonIntegerScale { ratio });
    }
    Ok(rounded as usize)
}

fn load_text_grid(path: &Path) -> Result<Array2<f64>, GridError> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| GridError::Io {
        path: display.clone(),
        source,
    })?;

    let mut values = Vec::new();
    let mut width: Option<usize> = None;
    let mut rows = 0;

    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let before = values.len();
        for token in line.split_whitespace() {
            let value: f64 = token.parse().map_err(|_| GridError::Parse {
                path: display.clone(),
                line: n + 1,
                message: format!("not a number: {token:?}"),
            })?;
            values.push(value);
        }
        let row_width = values.len() - before;
        match width {
            None => width = Some(row_width),
            Some(w) if w != row_width => {
                return Err(GridError::Parse {
                    path: display,
                    line: n + 1,
                    message: format!("expected {w} columns, found {row_width}"),
                })
            }
            Some(_) => {}
        }
        rows += 1;
    }

    let cols = width.ok_or(GridError::Empty)?;
    Array2::from_shape_vec((rows, cols), values).map_err(|e| GridError::Parse {
        path: display,
        line: 0,
        message: e.to_string(),
    })
}
