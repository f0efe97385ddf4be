//! Affine pixel → projected-coordinate mapping.
//!
//! Parameters follow the GDAL order `(x0, a, b, y0, c, d)`:
//!
//!   x = x0 + col·a + row·b
//!   y = y0 + col·c + row·d
//!
//! World file layout (one float per line), as written next to masks:
//!   1 : a   pixel width
//!   2 : c   row rotation
//!   3 : b   column rotation
//!   4 : d   pixel height (negative for north-up)
//!   5 : x0  origin x
//!   6 : y0  origin y

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub x0: f64,
    pub a: f64,
    pub b: f64,
    pub y0: f64,
    pub c: f64,
    pub d: f64,
}

impl GeoTransform {
    /// Build from the six GDAL parameters, rejecting unusable transforms.
    pub fn from_gdal(gt: [f64; 6]) -> Result<Self> {
        if gt.iter().any(|v| !v.is_finite()) {
            return Err(Error::config(format!(
                "geotransform has non-finite parameters: {gt:?}"
            )));
        }

        let t = Self {
            x0: gt[0],
            a: gt[1],
            b: gt[2],
            y0: gt[3],
            c: gt[4],
            d: gt[5],
        };

        if t.determinant().abs() < f64::EPSILON {
            return Err(Error::config(format!(
                "geotransform is singular (pixel size a={}, d={})",
                t.a, t.d
            )));
        }

        Ok(t)
    }

    /// Same as [`from_gdal`](Self::from_gdal) but from a slice of unknown length.
    pub fn from_slice(params: &[f64]) -> Result<Self> {
        let gt: [f64; 6] = params.try_into().map_err(|_| {
            Error::config(format!(
                "expected 6 geotransform parameters, got {}",
                params.len()
            ))
        })?;
        Self::from_gdal(gt)
    }

    #[inline]
    pub fn to_projected(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.x0 + col * self.a + row * self.b,
            self.y0 + col * self.c + row * self.d,
        )
    }

    #[inline]
    fn determinant(&self) -> f64 {
        self.a * self.d - self.b * self.c
    }

    /// GeoTIFF `ModelPixelScaleTag` + `ModelTiepointTag` (first tie point only).
    pub fn from_tiepoint_scale(tiepoint: &[f64], scale: &[f64]) -> Result<Self> {
        if tiepoint.len() < 6 || scale.len() < 2 {
            return Err(Error::config(format!(
                "incomplete GeoTIFF tie point/scale tags ({} / {} values)",
                tiepoint.len(),
                scale.len()
            )));
        }

        let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
        let (sx, sy) = (scale[0], scale[1]);

        Self::from_gdal([x - i * sx, sx, 0.0, y + j * sy, 0.0, -sy])
    }

    /// GeoTIFF `ModelTransformationTag`: a row-major 4×4 matrix.
    pub fn from_model_transformation(m: &[f64]) -> Result<Self> {
        if m.len() < 16 {
            return Err(Error::config(format!(
                "ModelTransformationTag needs 16 values, got {}",
                m.len()
            )));
        }

        Self::from_gdal([m[3], m[0], m[1], m[7], m[4], m[5]])
    }

    /// Move the origin by a fractional number of pixels (PixelIsPoint rasters).
    pub fn shifted(&self, dcol: f64, drow: f64) -> Self {
        let (x0, y0) = self.to_projected(dcol, drow);
        Self { x0, y0, ..*self }
    }

    pub fn to_world_file(&self) -> String {
        let mut out = String::new();
        for v in [self.a, self.c, self.b, self.d, self.x0, self.y0] {
            // Writing to a String cannot fail.
            let _ = writeln!(out, "{v}");
        }
        out
    }

    pub fn from_world_file(text: &str) -> Result<Self> {
        let values: Vec<f64> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| {
                l.parse::<f64>()
                    .map_err(|e| Error::config(format!("bad world file line '{l}': {e}")))
            })
            .collect::<Result<_>>()?;

        if values.len() != 6 {
            return Err(Error::config(format!(
                "world file must have 6 values, found {}",
                values.len()
            )));
        }

        let (a, c, b, d, x0, y0) = (
            values[0], values[1], values[2], values[3], values[4], values[5],
        );

        Self::from_gdal([x0, a, b, y0, c, d])
    }

    pub fn write_world_file(&self, raster_path: &Path) -> Result<PathBuf> {
        let path = world_file_path(raster_path);
        std::fs::write(&path, self.to_world_file())?;
        Ok(path)
    }

    pub fn read_world_file(raster_path: &Path) -> Result<Option<Self>> {
        let path = world_file_path(raster_path);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        Self::from_world_file(&text).map(Some)
    }
}

/// Sidecar world-file path for a raster (`.tfw`, `.pgw`, `.jgw`, else `.wld`).
pub fn world_file_path(raster_path: &Path) -> PathBuf {
    let ext = raster_path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();

    let sidecar = match ext.as_str() {
        "tif" | "tiff" => "tfw",
        "png" => "pgw",
        "jpg" | "jpeg" => "jgw",
        _ => "wld",
    };

    raster_path.with_extension(sidecar)
}
