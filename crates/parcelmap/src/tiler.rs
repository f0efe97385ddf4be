//! Dual-grid tiling: the raster is segmented twice, once on a patch grid
//! anchored at the origin and once on a grid shifted by half a patch, so that
//! every patch seam of one grid falls in the middle of a patch of the other.
//! The dilated grid masks are OR-merged.

use image::imageops;
use image::{GrayImage, Rgb, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use log::debug;
use rayon::prelude::*;

use crate::config::{ExtractParams, TilerParams};
use crate::error::{Error, Result};
use crate::segment::segment_patch;

const PAD_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GridKind {
    /// Grid 0, patches start at the raster origin.
    Aligned,
    /// Grid 1, shifted by half a patch in both axes.
    Offset,
}

impl GridKind {
    pub const BOTH: [GridKind; 2] = [GridKind::Aligned, GridKind::Offset];

    /// Top/left padding in pixels for patch size `p`.
    #[inline]
    pub fn lead(self, p: u32) -> u32 {
        match self {
            GridKind::Aligned => 0,
            GridKind::Offset => p / 2,
        }
    }
}

/// One patch of a padded grid: row `i`, column `j`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchId {
    pub grid: GridKind,
    pub i: u32,
    pub j: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub patches_per_grid: [usize; 2],
}

/// Padded size along one axis: lead padding plus `p` trailing padding,
/// rounded down to a multiple of `p`.
#[inline]
fn padded_len(len: u32, lead: u32, p: u32) -> u32 {
    ((len + lead + p) / p) * p
}

/// Pad `img` with white for `grid`.
pub fn pad_for_grid(img: &RgbImage, grid: GridKind, p: u32) -> RgbImage {
    let lead = grid.lead(p);
    let w = padded_len(img.width(), lead, p);
    let h = padded_len(img.height(), lead, p);

    let mut padded = RgbImage::from_pixel(w, h, PAD_COLOR);
    imageops::replace(&mut padded, img, lead as i64, lead as i64);
    padded
}

/// Row-major patch ids of a padded grid.
pub fn patch_ids(padded_w: u32, padded_h: u32, grid: GridKind, p: u32) -> Vec<PatchId> {
    let (rows, cols) = (padded_h / p, padded_w / p);
    (0..rows)
        .flat_map(|i| (0..cols).map(move |j| PatchId { grid, i, j }))
        .collect()
}

/// Segment every patch of one grid and reassemble the result, cropped back to
/// the raster extent. Returns the grid mask and the number of patches.
pub fn segment_grid(img: &RgbImage, grid: GridKind, params: &ExtractParams) -> (GrayImage, usize) {
    let p = params.tiler.patch_size;
    let lead = grid.lead(p);
    let padded = pad_for_grid(img, grid, p);
    let ids = patch_ids(padded.width(), padded.height(), grid, p);

    debug!(
        "{grid:?} grid: {}x{} padded, {} patches of {p}px",
        padded.width(),
        padded.height(),
        ids.len()
    );

    let masks: Vec<(PatchId, GrayImage)> = ids
        .par_iter()
        .map(|id| {
            let patch = imageops::crop_imm(&padded, id.j * p, id.i * p, p, p).to_image();
            (*id, segment_patch(&patch, &params.segment))
        })
        .collect();

    let mut assembled = GrayImage::new(padded.width(), padded.height());
    for (id, mask) in &masks {
        imageops::replace(&mut assembled, mask, (id.j * p) as i64, (id.i * p) as i64);
    }

    let mask = imageops::crop_imm(&assembled, lead, lead, img.width(), img.height()).to_image();
    (mask, ids.len())
}

/// Binary dilation with a `(2r+1)²` square, `iterations` times.
pub fn dilate_mask(mask: &GrayImage, radius: u8, iterations: u32) -> GrayImage {
    let mut out = mask.clone();
    if radius == 0 {
        return out;
    }
    for _ in 0..iterations {
        out = dilate(&out, Norm::LInf, radius);
    }
    out
}

/// Pixel-wise OR of two masks of identical extent.
pub fn merge_masks(a: &GrayImage, b: &GrayImage) -> Result<GrayImage> {
    if a.dimensions() != b.dimensions() {
        return Err(Error::config(format!(
            "cannot merge masks of different extent: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }

    let data: Vec<u8> = a
        .as_raw()
        .iter()
        .zip(b.as_raw().iter())
        .map(|(&x, &y)| if x != 0 || y != 0 { 255 } else { 0 })
        .collect();

    GrayImage::from_raw(a.width(), a.height(), data)
        .ok_or_else(|| Error::config("merged mask buffer has the wrong length"))
}

/// Segment both grids concurrently, dilate, and merge.
pub fn segment_dual_grid(img: &RgbImage, params: &ExtractParams) -> Result<(GrayImage, MergeReport)> {
    params.validate()?;
    let TilerParams {
        dilation_radius,
        dilation_iterations,
        ..
    } = params.tiler;

    let ((aligned, n_aligned), (offset, n_offset)) = rayon::join(
        || segment_grid(img, GridKind::Aligned, params),
        || segment_grid(img, GridKind::Offset, params),
    );

    let aligned = dilate_mask(&aligned, dilation_radius, dilation_iterations);
    let offset = dilate_mask(&offset, dilation_radius, dilation_iterations);

    let merged = merge_masks(&aligned, &offset)?;
    Ok((
        merged,
        MergeReport {
            patches_per_grid: [n_aligned, n_offset],
        },
    ))
}
