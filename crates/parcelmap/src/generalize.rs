//! Post-vectorization generalization.
//!
//! The protocol is fixed; only the backend executing each step varies:
//!
//! 1. import the raw collection with vertex snapping      → `read{run}`
//! 2. Douglas–Peucker, first tolerance                    → `gen{run}`
//! 3. drop slivers below an area threshold                → `cl{run}`
//! 4. Douglas–Peucker, final tolerance                    → `gfin{run}`
//! 5. export `gfin{run}` to the final GeoJSON, renumbering `parcelID`
//!
//! Layer names can never be reused inside a workspace, so every run works
//! under its own suffix. Any failure aborts the run and removes a partially
//! written final file.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use geo::{Coord, GeodesicArea, LineString, Polygon, Simplify};
use log::{debug, info, warn};

use crate::config::{GeneralizeParams, RunId};
use crate::error::{ExternalToolError, Result};
use crate::geojson;
use crate::vectorize::assign_ids;

/// The four workspace operations the protocol needs.
pub trait GeneralizationBackend {
    fn import_raw(&mut self, path: &Path, snap: f64, output: &str) -> Result<()>;
    fn simplify(&mut self, input: &str, tolerance: f64, output: &str) -> Result<()>;
    fn clean_slivers(&mut self, input: &str, area_tolerance: f64, output: &str) -> Result<()>;
    fn export(&mut self, input: &str, path: &Path) -> Result<()>;
}

/// Layer names of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerNames {
    pub read: String,
    pub gen: String,
    pub cleaned: String,
    pub fin: String,
}

impl LayerNames {
    pub fn for_run(run: RunId) -> Self {
        Self {
            read: run.layer("read"),
            gen: run.layer("gen"),
            cleaned: run.layer("cl"),
            fin: run.layer("gfin"),
        }
    }
}

/// Run the generalization protocol from `raw` to `out`.
pub fn generalize<B>(backend: &mut B, raw: &Path, out: &Path, params: &GeneralizeParams) -> Result<()>
where
    B: GeneralizationBackend + ?Sized,
{
    params.validate()?;
    let names = LayerNames::for_run(params.run);
    info!("Generalizing {} (run {})", raw.display(), params.run);

    let result = (|| -> Result<()> {
        backend.import_raw(raw, params.snap, &names.read)?;
        backend.simplify(&names.read, params.simplify_tolerance, &names.gen)?;
        backend.clean_slivers(&names.gen, params.sliver_area, &names.cleaned)?;
        backend.simplify(&names.cleaned, params.final_tolerance, &names.fin)?;
        backend.export(&names.fin, out)
    })();

    if result.is_err() && out.exists() {
        if let Err(e) = fs::remove_file(out) {
            warn!("could not remove partial output {}: {e}", out.display());
        }
    }

    result
}

// ---------------------------------------------------------------------------
// In-process backend
// ---------------------------------------------------------------------------

/// Named polygon layers of one run. Names are write-once.
#[derive(Debug, Default)]
pub struct Workspace {
    layers: HashMap<String, Vec<Polygon<f64>>>,
}

impl Workspace {
    pub fn insert(&mut self, name: &str, polygons: Vec<Polygon<f64>>) -> Result<()> {
        if self.layers.contains_key(name) {
            return Err(ExternalToolError::NameCollision {
                name: name.to_string(),
            }
            .into());
        }
        self.layers.insert(name.to_string(), polygons);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&[Polygon<f64>]> {
        self.layers.get(name).map(Vec::as_slice).ok_or_else(|| {
            ExternalToolError::MissingLayer {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }
}

/// Generalization with `geo` algorithms, no external tooling required.
///
/// Douglas–Peucker runs per polygon, so boundaries shared by neighbours are
/// simplified independently.
#[derive(Debug, Default)]
pub struct InProcessBackend {
    workspace: Workspace,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    fn check_free(&self, name: &str) -> Result<()> {
        if self.workspace.contains(name) {
            return Err(ExternalToolError::NameCollision {
                name: name.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl GeneralizationBackend for InProcessBackend {
    fn import_raw(&mut self, path: &Path, snap: f64, output: &str) -> Result<()> {
        self.check_free(output)?;
        let polygons = geojson::polygons_of(&geojson::read_collection(path)?)?;
        let snapped = snap_vertices(polygons, snap);
        debug!("imported {} polygons into {output}", snapped.len());
        self.workspace.insert(output, snapped)
    }

    fn simplify(&mut self, input: &str, tolerance: f64, output: &str) -> Result<()> {
        self.check_free(output)?;
        let simplified: Vec<Polygon<f64>> = self
            .workspace
            .get(input)?
            .iter()
            .map(|p| p.simplify(&tolerance))
            .filter(|p| p.exterior().0.len() >= 4)
            .collect();
        debug!("{input} → {output}: {} polygons", simplified.len());
        self.workspace.insert(output, simplified)
    }

    fn clean_slivers(&mut self, input: &str, area_tolerance: f64, output: &str) -> Result<()> {
        self.check_free(output)?;
        let layer = self.workspace.get(input)?;
        let kept: Vec<Polygon<f64>> = layer
            .iter()
            .filter(|p| p.geodesic_area_unsigned() >= area_tolerance)
            .cloned()
            .collect();
        debug!(
            "{input} → {output}: removed {} slivers",
            layer.len() - kept.len()
        );
        self.workspace.insert(output, kept)
    }

    fn export(&mut self, input: &str, path: &Path) -> Result<()> {
        let parcels = assign_ids(self.workspace.get(input)?.to_vec());
        geojson::write_parcels(path, &parcels)?;
        info!("Exported {} parcels to {}", parcels.len(), path.display());
        Ok(())
    }
}

/// Snap every vertex onto the first previously seen vertex within `snap`
/// (Euclidean, input units), then drop consecutive duplicates.
pub fn snap_vertices(polygons: Vec<Polygon<f64>>, snap: f64) -> Vec<Polygon<f64>> {
    if snap <= 0.0 {
        return polygons;
    }

    let mut grid: HashMap<(i64, i64), Vec<Coord<f64>>> = HashMap::new();
    let cell = |c: Coord<f64>| ((c.x / snap).floor() as i64, (c.y / snap).floor() as i64);

    let mut snap_coord = |c: Coord<f64>| -> Coord<f64> {
        let (cx, cy) = cell(c);
        for dx in -1..=1 {
            for dy in -1..=1 {
                if let Some(bucket) = grid.get(&(cx + dx, cy + dy)) {
                    if let Some(hit) = bucket
                        .iter()
                        .find(|s| (s.x - c.x).hypot(s.y - c.y) <= snap)
                    {
                        return *hit;
                    }
                }
            }
        }
        grid.entry((cx, cy)).or_default().push(c);
        c
    };

    let mut snap_ring = |ring: &LineString<f64>| -> LineString<f64> {
        let mut coords: Vec<Coord<f64>> = ring.coords().map(|&c| snap_coord(c)).collect();
        coords.dedup();
        LineString::from(coords)
    };

    polygons
        .iter()
        .filter_map(|p| {
            let exterior = snap_ring(p.exterior());
            if exterior.0.len() < 4 {
                return None;
            }
            let interiors = p
                .interiors()
                .iter()
                .map(&mut snap_ring)
                .filter(|r| r.0.len() >= 4)
                .collect();
            Some(Polygon::new(exterior, interiors))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// GRASS GIS backend
// ---------------------------------------------------------------------------

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Kills and reaps the child when dropped; a no-op once it has been waited on.
struct Reaper<'a>(&'a mut Child);

impl Drop for Reaper<'_> {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// Poll `child` until it exits or `timeout` elapses (`Ok(None)`). The child is
/// never left running or unreaped, whichever way this returns.
fn wait_or_kill(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let mut reaper = Reaper(child);
    let started = Instant::now();
    loop {
        if let Some(status) = reaper.0.try_wait()? {
            return Ok(Some(status));
        }
        if started.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Run `program args…`, killing it once `timeout` elapses.
pub fn run_tool(program: &Path, args: &[String], timeout: Duration) -> Result<()> {
    let tool = program.display().to_string();
    debug!("running {tool} {}", args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ExternalToolError::Spawn {
            tool: tool.clone(),
            source,
        })?;

    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        })
    });

    let status = match wait_or_kill(&mut child, timeout)? {
        Some(status) => status,
        None => return Err(ExternalToolError::Timeout { tool, timeout }.into()),
    };

    let stderr = stderr_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    if !status.success() {
        return Err(ExternalToolError::Failed {
            tool,
            status: status.to_string(),
            stderr: stderr.trim().to_string(),
        }
        .into());
    }

    Ok(())
}

/// Drives the `grass` executable in a throwaway database
/// `<base>/grassdata{run}/world{run}/user{run}` (EPSG:4326 location).
#[derive(Debug, Clone)]
pub struct GrassBackend {
    executable: PathBuf,
    gisdbase: PathBuf,
    location: String,
    mapset: String,
    timeout: Duration,
    created: HashSet<String>,
}

impl GrassBackend {
    pub fn new(run: RunId, timeout: Duration) -> Self {
        Self {
            executable: PathBuf::from("grass"),
            gisdbase: std::env::temp_dir().join(run.layer("grassdata")),
            location: run.layer("world"),
            mapset: run.layer("user"),
            timeout,
            created: HashSet::new(),
        }
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_base_dir(mut self, base: &Path) -> Self {
        if let Some(name) = self.gisdbase.file_name().map(|n| n.to_owned()) {
            self.gisdbase = base.join(name);
        }
        self
    }

    pub fn location_path(&self) -> PathBuf {
        self.gisdbase.join(&self.location)
    }

    pub fn mapset_path(&self) -> PathBuf {
        self.location_path().join(&self.mapset)
    }

    /// Argument lists creating the location, then the run mapset.
    pub fn setup_command_lines(&self) -> Vec<Vec<String>> {
        vec![
            vec![
                "-c".to_string(),
                "EPSG:4326".to_string(),
                "-e".to_string(),
                self.location_path().display().to_string(),
            ],
            vec![
                "-c".to_string(),
                "-e".to_string(),
                self.mapset_path().display().to_string(),
            ],
        ]
    }

    /// Argument list running one module inside the run mapset.
    pub fn module_command_line(&self, module: &str, options: &[(&str, String)]) -> Vec<String> {
        let mut args = vec![
            self.mapset_path().display().to_string(),
            "--exec".to_string(),
            module.to_string(),
        ];
        args.extend(options.iter().map(|(k, v)| format!("{k}={v}")));
        args.push("--quiet".to_string());
        args
    }

    fn ensure_workspace(&mut self) -> Result<()> {
        if self.mapset_path().is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.gisdbase)?;
        for args in self.setup_command_lines() {
            run_tool(&self.executable, &args, self.timeout)?;
        }
        if !self.mapset_path().is_dir() {
            return Err(ExternalToolError::MissingWorkspace(self.mapset_path()).into());
        }
        info!("Created GRASS mapset {}", self.mapset_path().display());
        Ok(())
    }

    fn claim(&mut self, name: &str) -> Result<()> {
        let on_disk = self.mapset_path().join("vector").join(name).exists();
        if on_disk || !self.created.insert(name.to_string()) {
            return Err(ExternalToolError::NameCollision {
                name: name.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn require(&self, name: &str) -> Result<()> {
        if self.created.contains(name) || self.mapset_path().join("vector").join(name).exists() {
            Ok(())
        } else {
            Err(ExternalToolError::MissingLayer {
                name: name.to_string(),
            }
            .into())
        }
    }

    fn exec(&self, module: &str, options: &[(&str, String)]) -> Result<()> {
        run_tool(
            &self.executable,
            &self.module_command_line(module, options),
            self.timeout,
        )
    }
}

impl GeneralizationBackend for GrassBackend {
    fn import_raw(&mut self, path: &Path, snap: f64, output: &str) -> Result<()> {
        self.ensure_workspace()?;
        self.claim(output)?;
        self.exec(
            "v.in.ogr",
            &[
                ("input", path.display().to_string()),
                ("output", output.to_string()),
                ("snap", format!("{snap:e}")),
            ],
        )
    }

    fn simplify(&mut self, input: &str, tolerance: f64, output: &str) -> Result<()> {
        self.require(input)?;
        self.claim(output)?;
        self.exec(
            "v.generalize",
            &[
                ("input", input.to_string()),
                ("output", output.to_string()),
                ("method", "douglas".to_string()),
                ("threshold", format!("{tolerance:e}")),
            ],
        )
    }

    fn clean_slivers(&mut self, input: &str, area_tolerance: f64, output: &str) -> Result<()> {
        self.require(input)?;
        self.claim(output)?;
        self.exec(
            "v.clean",
            &[
                ("input", input.to_string()),
                ("output", output.to_string()),
                ("tool", "rmarea".to_string()),
                ("threshold", format!("{area_tolerance}")),
            ],
        )
    }

    fn export(&mut self, input: &str, path: &Path) -> Result<()> {
        self.require(input)?;
        let staged = self.gisdbase.join(format!("{input}.geojson"));
        self.exec(
            "v.out.ogr",
            &[
                ("input", input.to_string()),
                ("output", staged.display().to_string()),
                ("format", "GeoJSON".to_string()),
            ],
        )?;

        let polygons = geojson::polygons_of(&geojson::read_collection(&staged)?)?;
        let parcels = assign_ids(polygons);
        geojson::write_parcels(path, &parcels)?;
        if let Err(e) = fs::remove_file(&staged) {
            warn!("could not remove {}: {e}", staged.display());
        }
        info!("Exported {} parcels to {}", parcels.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::vectorize::Parcel;
    use geo::polygon;

    /// Roughly `side_m` × `side_m` square at 52°N, 15°E.
    fn square_m(x0_m: f64, side_m: f64) -> Polygon<f64> {
        let deg_lat = 1.0 / 111_250.0;
        let deg_lon = 1.0 / 68_600.0;
        let (x0, y0) = (15.0 + x0_m * deg_lon, 52.0);
        let (dx, dy) = (side_m * deg_lon, side_m * deg_lat);
        polygon![
            (x: x0, y: y0),
            (x: x0 + dx, y: y0),
            (x: x0 + dx, y: y0 + dy),
            (x: x0, y: y0 + dy),
        ]
    }

    fn write_raw(dir: &Path, polygons: Vec<Polygon<f64>>) -> PathBuf {
        let path = dir.join("parcels_raw.geojson");
        geojson::write_parcels(&path, &assign_ids(polygons)).unwrap();
        path
    }

    #[test]
    fn protocol_uses_run_suffixed_names() {
        let names = LayerNames::for_run(RunId(3));
        assert_eq!(
            names,
            LayerNames {
                read: "read3".into(),
                gen: "gen3".into(),
                cleaned: "cl3".into(),
                fin: "gfin3".into(),
            }
        );
    }

    #[test]
    fn in_process_protocol_removes_slivers_and_renumbers() {
        let dir = tempfile::tempdir().unwrap();
        let raw = write_raw(
            dir.path(),
            vec![square_m(0.0, 30.0), square_m(100.0, 0.5), square_m(200.0, 20.0)],
        );
        let out = dir.path().join("parcels.geojson");

        let mut backend = InProcessBackend::new();
        let params = GeneralizeParams {
            run: RunId(1),
            ..Default::default()
        };
        generalize(&mut backend, &raw, &out, &params).unwrap();

        let parcels: Vec<Parcel> = geojson::read_parcels(&out).unwrap();
        assert_eq!(parcels.len(), 2);
        assert_eq!(parcels.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 2]);
        for name in ["read1", "gen1", "cl1", "gfin1"] {
            assert!(backend.workspace().contains(name), "{name}");
        }
    }

    #[test]
    fn reusing_a_run_id_is_a_name_collision() {
        let dir = tempfile::tempdir().unwrap();
        let raw = write_raw(dir.path(), vec![square_m(0.0, 30.0)]);
        let out = dir.path().join("parcels.geojson");
        let params = GeneralizeParams::default();

        let mut backend = InProcessBackend::new();
        generalize(&mut backend, &raw, &out, &params).unwrap();
        fs::remove_file(&out).unwrap();

        let err = generalize(&mut backend, &raw, &out, &params).unwrap_err();
        assert!(matches!(
            err,
            Error::ExternalTool(ExternalToolError::NameCollision { ref name }) if name == "read0"
        ));
        assert!(!out.exists());

        // A fresh run id in the same workspace is fine.
        let next = GeneralizeParams {
            run: RunId(1),
            ..Default::default()
        };
        generalize(&mut backend, &raw, &out, &next).unwrap();
    }

    #[test]
    fn missing_input_layer_is_reported() {
        let mut backend = InProcessBackend::new();
        let err = backend.simplify("nope", 1e-6, "gen9").unwrap_err();
        assert!(matches!(
            err,
            Error::ExternalTool(ExternalToolError::MissingLayer { .. })
        ));
    }

    #[test]
    fn snapping_merges_nearby_vertices() {
        let a = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0)];
        let b = polygon![(x: 1.0 + 1e-12, y: 1e-12), (x: 2.0, y: 0.0), (x: 2.0, y: 1.0)];
        let snapped = snap_vertices(vec![a, b], 1e-10);
        assert_eq!(snapped[1].exterior().0[0], Coord { x: 1.0, y: 0.0 });
    }

    #[test]
    fn grass_command_lines() {
        let backend = GrassBackend::new(RunId(5), Duration::from_secs(60))
            .with_base_dir(Path::new("/tmp"))
            .with_executable("/usr/bin/grass");

        assert_eq!(backend.mapset_path(), Path::new("/tmp/grassdata5/world5/user5"));
        assert_eq!(
            backend.setup_command_lines()[0],
            vec!["-c", "EPSG:4326", "-e", "/tmp/grassdata5/world5"]
        );

        let line = backend.module_command_line(
            "v.generalize",
            &[
                ("input", "read5".to_string()),
                ("output", "gen5".to_string()),
                ("method", "douglas".to_string()),
                ("threshold", format!("{:e}", 1e-6)),
            ],
        );
        assert_eq!(
            line,
            vec![
                "/tmp/grassdata5/world5/user5",
                "--exec",
                "v.generalize",
                "input=read5",
                "output=gen5",
                "method=douglas",
                "threshold=1e-6",
                "--quiet",
            ]
        );
    }

    #[test]
    fn missing_executable_is_a_spawn_error() {
        let err = run_tool(
            Path::new("/nonexistent/grass-binary"),
            &[],
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::ExternalTool(ExternalToolError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn slow_tool_times_out() {
        let started = Instant::now();
        let err = run_tool(
            Path::new("sleep"),
            &["5".to_string()],
            Duration::from_millis(200),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::ExternalTool(ExternalToolError::Timeout { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn timed_out_child_is_killed_and_reaped() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let status = wait_or_kill(&mut child, Duration::from_millis(100)).unwrap();
        assert!(status.is_none());
        // Already reaped: the cached exit status is available immediately.
        assert!(child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_fatal() {
        let err = run_tool(Path::new("false"), &[], Duration::from_secs(5)).unwrap_err();
        assert!(matches!(
            err,
            Error::ExternalTool(ExternalToolError::Failed { .. })
        ));
    }
}
