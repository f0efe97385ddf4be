//! Tunable parameters for every stage.
//!
//! Defaults reproduce the values the pipeline was calibrated with on scanned
//! cadastral sheets. All structs deserialize with per-field defaults so a
//! parameter file only needs to name what it overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Per-patch boundary segmentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentParams {
    /// Intensities `<= threshold` may grow into boundary regions.
    pub threshold: u8,
    /// Gaussian sigma of the Canny detector; smaller finds more edges.
    pub sigma: f32,
    /// Half-size of the local-maximum window for markers. `1` disables peak
    /// suppression.
    pub min_distance: u32,
    /// Mean-shift spatial window radius in pixels; `0` skips smoothing.
    pub spatial_radius: u32,
    /// Mean-shift color window radius (Euclidean, RGB units).
    pub color_radius: f32,
    pub mean_shift_max_iter: u32,
    /// Canny hysteresis thresholds as fractions of a full-range unit step.
    pub canny_low: f32,
    pub canny_high: f32,
}

impl Default for SegmentParams {
    fn default() -> Self {
        Self {
            threshold: 60,
            sigma: 0.3,
            min_distance: 1,
            spatial_radius: 20,
            color_radius: 55.0,
            mean_shift_max_iter: 5,
            canny_low: 0.1,
            canny_high: 0.2,
        }
    }
}

impl SegmentParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.sigma >= 0.0 && self.sigma.is_finite()) {
            return Err(Error::config(format!("sigma must be >= 0, got {}", self.sigma)));
        }
        if self.min_distance == 0 {
            return Err(Error::config("min_distance must be at least 1"));
        }
        if !(self.canny_low >= 0.0 && self.canny_low <= self.canny_high) {
            return Err(Error::config(format!(
                "canny thresholds must satisfy 0 <= low <= high, got {} / {}",
                self.canny_low, self.canny_high
            )));
        }
        if !(self.color_radius > 0.0) {
            return Err(Error::config("color_radius must be positive"));
        }
        Ok(())
    }
}

/// Dual-grid tiling and merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TilerParams {
    pub patch_size: u32,
    /// L∞ radius of the square structuring element (2 → 5×5).
    pub dilation_radius: u8,
    pub dilation_iterations: u32,
}

impl Default for TilerParams {
    fn default() -> Self {
        Self {
            patch_size: 256,
            dilation_radius: 2,
            dilation_iterations: 1,
        }
    }
}

impl TilerParams {
    pub fn validate(&self) -> Result<()> {
        if self.patch_size < 2 || self.patch_size % 2 != 0 {
            return Err(Error::config(format!(
                "patch size must be an even number >= 2, got {}",
                self.patch_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractParams {
    pub tiler: TilerParams,
    pub segment: SegmentParams,
}

impl ExtractParams {
    pub fn validate(&self) -> Result<()> {
        self.tiler.validate()?;
        self.segment.validate()
    }
}

/// Mask → polygon conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorizeParams {
    /// Parcels with a smaller geodesic area (m²) are discarded.
    pub min_area_m2: f64,
    /// Integer scaling used by the zero-buffer repair (1000 → millimetres).
    pub repair_scale: f64,
    pub miter_limit: f64,
}

impl Default for VectorizeParams {
    fn default() -> Self {
        Self {
            min_area_m2: 0.0,
            repair_scale: 1000.0,
            miter_limit: 2.0,
        }
    }
}

impl VectorizeParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_area_m2 >= 0.0) {
            return Err(Error::config("minimum parcel area must be >= 0"));
        }
        if !(self.repair_scale > 0.0) {
            return Err(Error::config("repair scale must be positive"));
        }
        Ok(())
    }
}

/// Identifies one pipeline run; every generalization artifact is suffixed
/// with it so concurrent runs never share a layer name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RunId(pub u32);

impl RunId {
    pub fn layer(&self, stem: &str) -> String {
        format!("{stem}{}", self.0)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generalization protocol tolerances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralizeParams {
    pub run: RunId,
    /// Vertex snapping distance on import (degrees).
    pub snap: f64,
    /// First Douglas–Peucker pass (degrees).
    pub simplify_tolerance: f64,
    /// Polygons below this geodesic area (m²) are removed as slivers.
    pub sliver_area: f64,
    /// Second Douglas–Peucker pass (degrees).
    pub final_tolerance: f64,
}

impl Default for GeneralizeParams {
    fn default() -> Self {
        Self {
            run: RunId::default(),
            snap: 1e-10,
            simplify_tolerance: 1e-6,
            sliver_area: 1.0,
            final_tolerance: 5e-6,
        }
    }
}

impl GeneralizeParams {
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("snap", self.snap),
            ("simplify tolerance", self.simplify_tolerance),
            ("sliver area", self.sliver_area),
            ("final tolerance", self.final_tolerance),
        ] {
            if !(v >= 0.0 && v.is_finite()) {
                return Err(Error::config(format!("{name} must be >= 0, got {v}")));
            }
        }
        Ok(())
    }
}

/// Everything a run needs besides paths; loadable from a JSON parameter file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    pub extract: ExtractParams,
    pub vectorize: VectorizeParams,
    pub generalize: GeneralizeParams,
}

impl PipelineParams {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.extract.validate()?;
        self.vectorize.validate()?;
        self.generalize.validate()
    }
}
