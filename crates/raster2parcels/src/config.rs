use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use parcelmap::{PipelineParams, RunId};

/// `raster2parcels` - land-parcel polygons from orthorectified rasters.
///
/// `extract` segments a raster into a boundary mask, `vectorize` turns a mask
/// into generalized GeoJSON parcels, `run` does both.
#[derive(Parser, Debug)]
#[command(name = "raster2parcels", version, about, long_about = None)]
pub struct Cli {
    /// JSON parameter file (any subset of extract / vectorize / generalize
    /// sections). Command-line flags override its values.
    #[arg(long, global = true, env = "PARCELS_PARAMS")]
    pub params: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Raster → boundary mask.
    Extract(ExtractArgs),
    /// Boundary mask → parcels.
    Vectorize(VectorizeArgs),
    /// Raster → boundary mask → parcels.
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    /// Source raster (GeoTIFF, or PNG/JPEG with a world file).
    #[arg(long, env = "PARCELS_INPUT")]
    pub input: PathBuf,

    /// Output mask path; the format follows the extension.
    #[arg(long, env = "PARCELS_MASK")]
    pub mask: PathBuf,

    #[command(flatten)]
    pub raster: RasterArgs,

    #[command(flatten)]
    pub segmentation: SegmentationArgs,
}

#[derive(Args, Debug, Clone)]
pub struct VectorizeArgs {
    /// Boundary mask produced by `extract`.
    #[arg(long, env = "PARCELS_MASK")]
    pub mask: PathBuf,

    /// Raster holding the georeference (defaults to the mask itself).
    #[arg(long, env = "PARCELS_GEOREF")]
    pub georef: Option<PathBuf>,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, env = "PARCELS_INPUT")]
    pub input: PathBuf,

    /// Intermediate mask path.
    #[arg(long, env = "PARCELS_MASK")]
    pub mask: PathBuf,

    #[command(flatten)]
    pub raster: RasterArgs,

    #[command(flatten)]
    pub segmentation: SegmentationArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct RasterArgs {
    /// Input has a fourth (alpha) band to strip.
    #[arg(long, env = "PARCELS_RGBA", default_value_t = false)]
    pub rgba: bool,

    /// Write a world file next to the mask.
    #[arg(long, env = "PARCELS_WORLD_FILE", default_value_t = false)]
    pub world_file: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SegmentationArgs {
    /// Patch edge length in pixels (even).
    #[arg(long, env = "PARCELS_PATCH_SIZE")]
    pub patch_size: Option<u32>,

    /// Intensities at or below this value may become boundary.
    #[arg(long, env = "PARCELS_THRESHOLD")]
    pub threshold: Option<u8>,

    /// Canny Gaussian sigma.
    #[arg(long, env = "PARCELS_SIGMA")]
    pub sigma: Option<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Douglas–Peucker and sliver removal in this process.
    InProcess,
    /// GRASS GIS `v.generalize` / `v.clean` through the `grass` executable.
    Grass,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Backend::InProcess => "in-process",
            Backend::Grass => "grass",
        };

        f.write_str(s)
    }
}

#[derive(Args, Debug, Clone)]
pub struct OutputArgs {
    /// Final GeoJSON; the raw collection goes to `<stem>_raw.geojson`.
    #[arg(long, env = "PARCELS_POLYGONS")]
    pub polygons: PathBuf,

    /// Projected CRS of the raster: `EPSG:<code>` or a `+proj=` definition.
    #[arg(long, env = "PARCELS_SOURCE_CRS")]
    pub source_crs: String,

    /// Minimum geodesic parcel area in m².
    #[arg(long, env = "PARCELS_MIN_AREA")]
    pub min_area: Option<f64>,

    /// Also save the skeleton raster here.
    #[arg(long, env = "PARCELS_SKELETON_OUT")]
    pub skeleton_out: Option<PathBuf>,

    /// Delete the raw collection once the final one is written.
    #[arg(long, env = "PARCELS_DELETE_RAW", default_value_t = false)]
    pub delete_raw: bool,

    /// Workspace namespace of this run (default: process id).
    #[arg(long, env = "PARCELS_RUN_ID")]
    pub run_id: Option<u32>,

    #[arg(long, env = "PARCELS_SNAP")]
    pub snap: Option<f64>,

    #[arg(long, env = "PARCELS_SIMPLIFY_TOLERANCE")]
    pub simplify_tolerance: Option<f64>,

    /// Slivers below this geodesic area (m²) are removed.
    #[arg(long, env = "PARCELS_SLIVER_AREA")]
    pub sliver_area: Option<f64>,

    #[arg(long, env = "PARCELS_FINAL_TOLERANCE")]
    pub final_tolerance: Option<f64>,

    #[arg(long, value_enum, env = "PARCELS_BACKEND", default_value_t = Backend::InProcess)]
    pub backend: Backend,

    /// Upper bound for every external tool invocation.
    #[arg(long, env = "PARCELS_TOOL_TIMEOUT_SECS", default_value_t = 600)]
    pub tool_timeout_secs: u64,

    #[arg(long, env = "PARCELS_GRASS", default_value = "grass")]
    pub grass_executable: PathBuf,
}

impl SegmentationArgs {
    pub fn apply(&self, params: &mut PipelineParams) {
        if let Some(p) = self.patch_size {
            params.extract.tiler.patch_size = p;
        }
        if let Some(t) = self.threshold {
            params.extract.segment.threshold = t;
        }
        if let Some(s) = self.sigma {
            params.extract.segment.sigma = s;
        }
    }
}

impl OutputArgs {
    pub fn apply(&self, params: &mut PipelineParams) {
        if let Some(a) = self.min_area {
            params.vectorize.min_area_m2 = a;
        }
        if let Some(id) = self.run_id {
            params.generalize.run = RunId(id);
        } else if params.generalize.run == RunId::default() {
            params.generalize.run = RunId(std::process::id());
        }
        let g = &mut params.generalize;
        for (slot, value) in [
            (&mut g.snap, self.snap),
            (&mut g.simplify_tolerance, self.simplify_tolerance),
            (&mut g.sliver_area, self.sliver_area),
            (&mut g.final_tolerance, self.final_tolerance),
        ] {
            if let Some(v) = value {
                *slot = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_subcommand_parses_and_overrides() {
        let cli = Cli::try_parse_from([
            "raster2parcels",
            "run",
            "--input",
            "sheet.tif",
            "--mask",
            "mask.tif",
            "--polygons",
            "parcels.geojson",
            "--source-crs",
            "EPSG:32633",
            "--threshold",
            "128",
            "--run-id",
            "7",
            "--backend",
            "grass",
        ])
        .unwrap();

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.output.backend, Backend::Grass);

        let mut params = PipelineParams::default();
        args.segmentation.apply(&mut params);
        args.output.apply(&mut params);
        assert_eq!(params.extract.segment.threshold, 128);
        assert_eq!(params.extract.tiler.patch_size, 256);
        assert_eq!(params.generalize.run, RunId(7));
        assert_eq!(params.generalize.final_tolerance, 5e-6);
    }

    #[test]
    fn missing_run_id_falls_back_to_process_id() {
        let cli = Cli::try_parse_from([
            "raster2parcels",
            "vectorize",
            "--mask",
            "mask.tif",
            "--polygons",
            "p.geojson",
            "--source-crs",
            "32633",
        ])
        .unwrap();
        let Command::Vectorize(args) = cli.command else {
            panic!("expected vectorize");
        };
        let mut params = PipelineParams::default();
        args.output.apply(&mut params);
        assert_eq!(params.generalize.run, RunId(std::process::id()));
    }
}
