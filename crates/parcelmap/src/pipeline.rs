//! Stage orchestration: raster → mask → raw parcels → generalized parcels.
//!
//! Each entry point validates its parameters before touching any pixel, logs
//! progress at stage boundaries and honours a [`CancelToken`] between stages.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{info, warn};

use crate::config::{ExtractParams, GeneralizeParams, VectorizeParams};
use crate::error::{Error, Result};
use crate::generalize::{generalize, GeneralizationBackend};
use crate::geojson;
use crate::raster::{self, Georeference};
use crate::reproject::{CrsId, Reprojector};
use crate::tiler::{segment_dual_grid, MergeReport};
use crate::vectorize::{vectorize, VectorizeReport};

/// Cooperative cancellation, checked between coarse stages only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractJob<'a> {
    pub input: &'a Path,
    pub mask_out: &'a Path,
    /// Input has an alpha band to strip.
    pub rgba: bool,
    /// Write a world file next to the mask.
    pub world_file: bool,
}

#[derive(Debug, Clone)]
pub struct VectorizeJob<'a> {
    pub mask: &'a Path,
    /// Raster carrying the georeference; usually the source image. The
    /// mask's own world file is used when this has none.
    pub georef: &'a Path,
    pub source_crs: &'a CrsId,
    pub polygons_out: &'a Path,
    pub skeleton_out: Option<&'a Path>,
    /// Remove the raw collection after a successful generalization.
    pub delete_raw: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub merge: Option<MergeReport>,
    pub vectorize: VectorizeReport,
    pub raw_path: PathBuf,
    pub raw_deleted: bool,
}

/// Raster → merged boundary mask on disk.
pub fn extract_boundaries(
    job: &ExtractJob<'_>,
    params: &ExtractParams,
    cancel: &CancelToken,
) -> Result<MergeReport> {
    params.validate()?;
    let started = Instant::now();

    let image = raster::load_rgb(job.input, job.rgba)?;
    let georef = if job.world_file {
        let g = raster::read_georeference(job.input)?;
        if g.is_none() {
            warn!(
                "{} has no georeference; mask is written without a world file",
                job.input.display()
            );
        }
        g
    } else {
        None
    };
    cancel.check()?;

    info!(
        "Segmenting {}x{} raster with {}px patches",
        image.width(),
        image.height(),
        params.tiler.patch_size
    );
    let (mask, report) = segment_dual_grid(&image, params)?;
    info!(
        "Segmentation done: {} + {} patches in {:.1?}",
        report.patches_per_grid[0],
        report.patches_per_grid[1],
        started.elapsed()
    );
    cancel.check()?;

    raster::save_mask(&mask, job.mask_out, georef.as_ref().map(|g| &g.transform))?;
    Ok(report)
}

fn resolve_georeference(job: &VectorizeJob<'_>) -> Result<Georeference> {
    if let Some(g) = raster::read_georeference(job.georef)? {
        return Ok(g);
    }
    if job.mask != job.georef {
        if let Some(g) = raster::read_georeference(job.mask)? {
            return Ok(g);
        }
    }
    Err(Error::config(format!(
        "no geotransform for {} (no GeoTIFF tags, no world file)",
        job.georef.display()
    )))
}

/// Mask → raw parcel collection at `<polygons stem>_raw.geojson`.
pub fn vectorize_mask(
    job: &VectorizeJob<'_>,
    params: &VectorizeParams,
    cancel: &CancelToken,
) -> Result<(PathBuf, VectorizeReport)> {
    params.validate()?;
    let georef = resolve_georeference(job)?;

    if let (Some(declared), Some(in_file)) = (job.source_crs.epsg(), georef.projected_cs) {
        if declared != in_file {
            warn!(
                "declared CRS EPSG:{declared} differs from the raster's EPSG:{in_file}; using the declared one"
            );
        }
    }

    let reprojector = Reprojector::new(job.source_crs)?;
    let mask = raster::load_mask(job.mask)?;
    cancel.check()?;

    info!(
        "Vectorizing {} ({}x{}) in {}",
        job.mask.display(),
        mask.width(),
        mask.height(),
        job.source_crs
    );
    let (parcels, skeleton, report) = vectorize(&mask, &georef.transform, &reprojector, params)?;
    info!(
        "Vectorization: {} contours, {} relevant, {} repaired, {} after area filter, {} parcels ({} skipped)",
        report.contours_total,
        report.contours_relevant,
        report.polygons_repaired,
        report.polygons_after_area_filter,
        report.parcels,
        report.skipped
    );

    if let Some(path) = job.skeleton_out {
        raster::save_mask(&skeleton, path, Some(&georef.transform))?;
    }
    cancel.check()?;

    let raw = geojson::raw_path_for(job.polygons_out);
    geojson::write_parcels(&raw, &parcels)?;
    info!("Wrote raw polygons {}", raw.display());

    Ok((raw, report))
}

/// Vectorize, then generalize into `polygons_out`. The raw collection is kept
/// on failure.
pub fn generate_polygons(
    job: &VectorizeJob<'_>,
    vectorize_params: &VectorizeParams,
    generalize_params: &GeneralizeParams,
    backend: &mut dyn GeneralizationBackend,
    cancel: &CancelToken,
) -> Result<PipelineReport> {
    generalize_params.validate()?;
    let (raw, report) = vectorize_mask(job, vectorize_params, cancel)?;
    cancel.check()?;

    generalize(&mut *backend, &raw, job.polygons_out, generalize_params)?;
    info!("Final polygons at {}", job.polygons_out.display());

    let mut raw_deleted = false;
    if job.delete_raw {
        match fs::remove_file(&raw) {
            Ok(()) => {
                raw_deleted = true;
                info!("Deleted {}", raw.display());
            }
            Err(e) => warn!("could not delete {}: {e}", raw.display()),
        }
    }

    Ok(PipelineReport {
        merge: None,
        vectorize: report,
        raw_path: raw,
        raw_deleted,
    })
}

/// Both stages back to back. The georeference and CRS are checked before any
/// pixel is read.
pub fn run(
    extract: &ExtractJob<'_>,
    job: &VectorizeJob<'_>,
    extract_params: &ExtractParams,
    vectorize_params: &VectorizeParams,
    generalize_params: &GeneralizeParams,
    backend: &mut dyn GeneralizationBackend,
    cancel: &CancelToken,
) -> Result<PipelineReport> {
    extract_params.validate()?;
    vectorize_params.validate()?;
    generalize_params.validate()?;
    resolve_georeference(job)?;
    Reprojector::new(job.source_crs)?;

    let merge = extract_boundaries(extract, extract_params, cancel)?;
    cancel.check()?;
    let mut report = generate_polygons(job, vectorize_params, generalize_params, backend, cancel)?;
    report.merge = Some(merge);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check().is_ok());
        other.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }
}
