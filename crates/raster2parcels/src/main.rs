mod config;

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use parcelmap::pipeline;
use parcelmap::{
    extract_boundaries, generate_polygons, CancelToken, CrsId, ExtractJob, GeneralizationBackend,
    GrassBackend, InProcessBackend, PipelineParams, PipelineReport, VectorizeJob,
};

use config::{Backend, Cli, Command, OutputArgs};

fn load_params(path: Option<&Path>) -> Result<PipelineParams> {
    match path {
        Some(p) => PipelineParams::from_json_file(p)
            .with_context(|| format!("reading parameter file {}", p.display())),
        None => Ok(PipelineParams::default()),
    }
}

fn make_backend(out: &OutputArgs, params: &PipelineParams) -> Box<dyn GeneralizationBackend> {
    match out.backend {
        Backend::InProcess => Box::new(InProcessBackend::new()),
        Backend::Grass => Box::new(
            GrassBackend::new(
                params.generalize.run,
                Duration::from_secs(out.tool_timeout_secs),
            )
            .with_executable(out.grass_executable.clone()),
        ),
    }
}

fn log_report(report: &PipelineReport, polygons: &Path) {
    if let Some(merge) = &report.merge {
        info!(
            "Patches: {} aligned, {} offset",
            merge.patches_per_grid[0], merge.patches_per_grid[1]
        );
    }
    info!(
        "{} parcels -> {} (raw {}{})",
        report.vectorize.parcels,
        polygons.display(),
        report.raw_path.display(),
        if report.raw_deleted { ", deleted" } else { "" }
    );
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let started = Instant::now();

    let mut params = load_params(cli.params.as_deref())?;
    let cancel = CancelToken::new();

    match cli.command {
        Command::Extract(args) => {
            args.segmentation.apply(&mut params);
            params.extract.validate().context("invalid extraction parameters")?;

            let job = ExtractJob {
                input: &args.input,
                mask_out: &args.mask,
                rgba: args.raster.rgba,
                world_file: args.raster.world_file,
            };
            let report = extract_boundaries(&job, &params.extract, &cancel)
                .with_context(|| format!("extracting boundaries from {}", args.input.display()))?;
            info!(
                "Mask {} from {} + {} patches",
                args.mask.display(),
                report.patches_per_grid[0],
                report.patches_per_grid[1]
            );
        }
        Command::Vectorize(args) => {
            args.output.apply(&mut params);
            params.validate().context("invalid parameters")?;
            info!("Effective parameters: {}", serde_json::to_string(&params)?);

            let crs: CrsId = args.output.source_crs.parse()?;
            let georef = args.georef.as_deref().unwrap_or(args.mask.as_path());
            let job = VectorizeJob {
                mask: &args.mask,
                georef,
                source_crs: &crs,
                polygons_out: &args.output.polygons,
                skeleton_out: args.output.skeleton_out.as_deref(),
                delete_raw: args.output.delete_raw,
            };
            let mut backend = make_backend(&args.output, &params);
            let report = generate_polygons(
                &job,
                &params.vectorize,
                &params.generalize,
                backend.as_mut(),
                &cancel,
            )
            .with_context(|| format!("vectorizing {}", args.mask.display()))?;
            log_report(&report, &args.output.polygons);
        }
        Command::Run(args) => {
            args.segmentation.apply(&mut params);
            args.output.apply(&mut params);
            params.validate().context("invalid parameters")?;
            info!("Effective parameters: {}", serde_json::to_string(&params)?);

            let crs: CrsId = args.output.source_crs.parse()?;
            let extract = ExtractJob {
                input: &args.input,
                mask_out: &args.mask,
                rgba: args.raster.rgba,
                world_file: args.raster.world_file,
            };
            let job = VectorizeJob {
                mask: &args.mask,
                georef: &args.input,
                source_crs: &crs,
                polygons_out: &args.output.polygons,
                skeleton_out: args.output.skeleton_out.as_deref(),
                delete_raw: args.output.delete_raw,
            };
            let mut backend = make_backend(&args.output, &params);
            let report = pipeline::run(
                &extract,
                &job,
                &params.extract,
                &params.vectorize,
                &params.generalize,
                backend.as_mut(),
                &cancel,
            )
            .with_context(|| format!("processing {}", args.input.display()))?;
            log_report(&report, &args.output.polygons);
        }
    }

    info!("Done in {:.1?}", started.elapsed());
    Ok(())
}
