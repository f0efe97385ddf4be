//! parcelmap: land-parcel polygons from orthorectified rasters.
//!
//! Pipeline (each stage is a module):
//!
//!   raster      GeoTIFF / PNG + world file → RGB pixels + GeoTransform
//!   tiler       two patch grids (aligned, offset by P/2), segmented in parallel
//!   segment     per patch: mean shift → luma → Canny → distance transform →
//!               peak markers → thresholded watershed → {0,255} mask
//!   tiler       reassemble, dilate (5×5), OR-merge → boundary mask
//!   skeleton    Zhang–Suen thinning of the boundary mask
//!   vectorize   contour hierarchy → relevant rings → georeference → repair →
//!               EPSG:4326 → area filter → exterior rings → dense ids
//!   geojson     raw collection `<stem>_raw.geojson`
//!   generalize  snap → Douglas–Peucker → sliver removal → Douglas–Peucker →
//!               final collection with renumbered `parcelID`
//!
//! Masks use 255 for boundary pixels and 0 for parcel interiors. Parcels are
//! emitted longitude-first.

pub mod config;
pub mod error;
pub mod generalize;
pub mod geojson;
pub mod geotransform;
pub mod pipeline;
pub mod raster;
pub mod reproject;
pub mod segment;
pub mod skeleton;
pub mod tiler;
pub mod vectorize;

pub use config::{
    ExtractParams, GeneralizeParams, PipelineParams, RunId, SegmentParams, TilerParams,
    VectorizeParams,
};
pub use error::{Error, ExternalToolError, Result};
pub use generalize::{generalize, GeneralizationBackend, GrassBackend, InProcessBackend};
pub use geotransform::GeoTransform;
pub use pipeline::{
    extract_boundaries, generate_polygons, vectorize_mask, CancelToken, ExtractJob,
    PipelineReport, VectorizeJob,
};
pub use raster::GeoRaster;
pub use reproject::{AxisOrder, CrsId, Reprojector};
pub use segment::segment_patch;
pub use tiler::{merge_masks, segment_dual_grid, GridKind, MergeReport, PatchId};
pub use vectorize::{Parcel, VectorizeReport};
