//! Test doubles and fixture builders.
//!
//! [`ScriptedToolRunner`] answers tool invocations with closures instead of
//! processes. [`FakeToolchain`] builds one that behaves like the stereo
//! toolchain and alignment script closely enough to run whole jobs.

use crate::config::ToolConfig;
use crate::errors::{DemflowError, Result};
use crate::raster::{geotiff, GeoTransform, Raster};
use crate::tools::{ToolCommand, ToolOutcome, ToolRunner};
use crate::utils::with_suffix;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use crate::events::CollectingEventSink;

type Handler = Arc<dyn Fn(&ToolCommand) -> ToolOutcome + Send + Sync>;

/// A [`ToolRunner`] that dispatches on the program name.
///
/// A program matches a handler by its full string or by its file name. An
/// unmatched program fails to launch with `NotFound`, like a missing binary.
#[derive(Default)]
pub struct ScriptedToolRunner {
    handlers: HashMap<String, Handler>,
    calls: Mutex<Vec<ToolCommand>>,
}

impl ScriptedToolRunner {
    /// Creates a runner with no programs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for a program.
    #[must_use]
    pub fn on<F>(mut self, program: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&ToolCommand) -> ToolOutcome + Send + Sync + 'static,
    {
        self.handlers.insert(program.into(), Arc::new(handler));
        self
    }

    /// Returns every command run so far, in order.
    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().clone()
    }

    /// Returns the commands run for one program.
    pub fn calls_to(&self, program: &str) -> Vec<ToolCommand> {
        self.calls
            .lock()
            .iter()
            .filter(|c| program_matches(&c.program, program))
            .cloned()
            .collect()
    }

    fn handler(&self, program: &str) -> Option<Handler> {
        self.handlers
            .iter()
            .find(|(name, _)| program_matches(program, name))
            .map(|(_, h)| Arc::clone(h))
    }
}

fn program_matches(program: &str, name: &str) -> bool {
    program == name || Path::new(program).file_name().is_some_and(|f| f == name)
}

impl fmt::Debug for ScriptedToolRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedToolRunner")
            .field("programs", &self.handlers.keys().collect::<Vec<_>>())
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

#[async_trait]
impl ToolRunner for ScriptedToolRunner {
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutcome> {
        self.calls.lock().push(command.clone());
        let handler = self.handler(&command.program).ok_or_else(|| DemflowError::ToolLaunch {
            program: command.program.clone(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        Ok(handler(command))
    }
}

/// An outcome forced on commands of one program whose arguments contain a
/// marker, such as an input directory name or an alignment method.
#[derive(Debug, Clone)]
struct Override {
    program: String,
    marker: String,
    outcome: ToolOutcome,
}

/// Emulates `aster2asp`, `stereo`, `point2dem` and the alignment script.
///
/// Rasterization writes a flat single-band DEM in the requested projection and
/// resolution; alignment copies its input DEM under the method's output name.
#[derive(Debug, Clone)]
pub struct FakeToolchain {
    tools: ToolConfig,
    scene: (f64, f64),
    size: (usize, usize),
    origin: (f64, f64),
    elevation: f32,
    elevations: Vec<(String, f32)>,
    overrides: Vec<Override>,
}

impl Default for FakeToolchain {
    fn default() -> Self {
        Self::new(ToolConfig::default())
    }
}

impl FakeToolchain {
    /// Creates a toolchain answering to the program names in `tools`.
    #[must_use]
    pub fn new(tools: ToolConfig) -> Self {
        Self {
            tools,
            scene: (77.4, 32.3),
            size: (8, 6),
            origin: (500_000.0, 3_600_000.0),
            elevation: 100.0,
            elevations: Vec::new(),
            overrides: Vec::new(),
        }
    }

    /// Sets the scene centre written into the camera model.
    #[must_use]
    pub fn with_scene(mut self, lon: f64, lat: f64) -> Self {
        self.scene = (lon, lat);
        self
    }

    /// Sets the DEM size in pixels.
    #[must_use]
    pub fn with_dem_size(mut self, width: usize, height: usize) -> Self {
        self.size = (width, height);
        self
    }

    /// Sets the default DEM elevation.
    #[must_use]
    pub fn with_elevation(mut self, elevation: f32) -> Self {
        self.elevation = elevation;
        self
    }

    /// Sets the elevation of DEMs whose output prefix contains `marker`.
    #[must_use]
    pub fn with_elevation_for(mut self, marker: impl Into<String>, elevation: f32) -> Self {
        self.elevations.push((marker.into(), elevation));
        self
    }

    /// Forces `outcome` on `program` when an argument contains `marker`.
    /// An empty marker matches every invocation.
    #[must_use]
    pub fn with_outcome(
        mut self,
        program: impl Into<String>,
        marker: impl Into<String>,
        outcome: ToolOutcome,
    ) -> Self {
        self.overrides.push(Override {
            program: program.into(),
            marker: marker.into(),
            outcome,
        });
        self
    }

    /// Makes `program` exit with `exit_code` when an argument contains `marker`.
    #[must_use]
    pub fn with_failure(
        self,
        program: impl Into<String>,
        marker: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        self.with_outcome(program, marker, ToolOutcome::exited(exit_code, "", stderr))
    }

    /// Builds the scripted runner.
    #[must_use]
    pub fn runner(&self) -> ScriptedToolRunner {
        let this = Arc::new(self.clone());
        let programs = [
            self.tools.conversion_program.clone(),
            self.tools.stereo_program.clone(),
            self.tools.rasterization_program.clone(),
            self.tools.alignment_interpreter.clone(),
        ];
        programs.into_iter().fold(ScriptedToolRunner::new(), |runner, program| {
            let this = Arc::clone(&this);
            let name = program.clone();
            runner.on(program, move |cmd| this.respond(&name, cmd))
        })
    }

    fn respond(&self, program: &str, cmd: &ToolCommand) -> ToolOutcome {
        let forced = self.overrides.iter().find(|o| {
            program_matches(program, &o.program) && cmd.args.iter().any(|a| a.contains(&o.marker))
        });
        if let Some(o) = forced {
            return o.outcome.clone();
        }

        let written = if program == self.tools.conversion_program {
            self.convert(cmd)
        } else if program == self.tools.stereo_program {
            Self::correlate(cmd)
        } else if program == self.tools.rasterization_program {
            self.rasterize(cmd)
        } else {
            Self::align(cmd)
        };
        match written {
            Ok(message) => ToolOutcome::exited(0, message, ""),
            Err(e) => ToolOutcome::exited(1, "", e.to_string()),
        }
    }

    fn convert(&self, cmd: &ToolCommand) -> Result<String> {
        let prefix = PathBuf::from(last_arg(cmd)?);
        for suffix in ["-Band3N.tif", "-Band3B.tif", "-Band3B.xml"] {
            std::fs::write(with_suffix(&prefix, suffix), b"fake")?;
        }
        let (lon, lat) = self.scene;
        std::fs::write(
            with_suffix(&prefix, "-Band3N.xml"),
            format!(
                "<ASTER><LONGITUDE_LATITUDE_HEIGHT>\
                 <ROW_0>{lon}, {lat}, 1000.0</ROW_0>\
                 </LONGITUDE_LATITUDE_HEIGHT></ASTER>"
            ),
        )?;
        Ok(format!("Writing: {}-Band3N.tif", prefix.display()))
    }

    fn correlate(cmd: &ToolCommand) -> Result<String> {
        let prefix = PathBuf::from(last_arg(cmd)?);
        std::fs::write(with_suffix(&prefix, "-PC.tif"), b"fake point cloud")?;
        Ok("Stereo pipeline finished".to_string())
    }

    fn rasterize(&self, cmd: &ToolCommand) -> Result<String> {
        let prefix = PathBuf::from(flag_value(cmd, "-o")?);
        let resolution: f64 = flag_value(cmd, "--tr")?
            .parse()
            .map_err(|_| DemflowError::config("bad --tr"))?;
        let crs = flag_value(cmd, "--t_srs")?.to_string();
        let elevation = self
            .elevations
            .iter()
            .find(|(marker, _)| prefix.to_string_lossy().contains(marker.as_str()))
            .map_or(self.elevation, |(_, e)| *e);

        let (width, height) = self.size;
        let raster = Raster::filled(
            width,
            height,
            elevation,
            GeoTransform::north_up(self.origin.0, self.origin.1, resolution),
            Some(crs),
        );
        geotiff::write(&with_suffix(&prefix, "-DEM.tif"), &raster)?;
        Ok(format!("Writing: {}-DEM.tif", prefix.display()))
    }

    fn align(cmd: &ToolCommand) -> Result<String> {
        let name = match flag_value(cmd, "--method")? {
            "cop30" => "COP30",
            _ => "ICESat2",
        };
        let dem = Path::new(flag_value(cmd, "--dem-file")?);
        let out_dir = Path::new(flag_value(cmd, "--output-dir")?);
        let stem = dem.file_stem().map_or_else(|| "dem".into(), |s| s.to_string_lossy());
        let output = out_dir.join(format!("{stem}_{name}_DEM.tif"));
        std::fs::copy(dem, &output)?;
        Ok(format!("Aligned DEM written to {}", output.display()))
    }
}

fn last_arg(cmd: &ToolCommand) -> Result<&str> {
    cmd.args
        .last()
        .map(String::as_str)
        .ok_or_else(|| DemflowError::config("missing output prefix"))
}

fn flag_value<'a>(cmd: &'a ToolCommand, flag: &str) -> Result<&'a str> {
    cmd.args
        .iter()
        .position(|a| a == flag)
        .and_then(|i| cmd.args.get(i + 1))
        .map(String::as_str)
        .ok_or_else(|| DemflowError::config(format!("missing {flag}")))
}

/// Writes a raster as a GeoTIFF.
pub fn write_dem(path: &Path, raster: &Raster) -> Result<()> {
    geotiff::write(path, raster)
}

/// Writes a `width` x `height` DEM of constant `value` at 30 m in UTM 43N.
pub fn write_flat_dem(path: &Path, width: usize, height: usize, value: f32) -> Result<()> {
    let raster = Raster::filled(
        width,
        height,
        value,
        GeoTransform::north_up(500_000.0, 3_600_000.0, 30.0),
        Some("EPSG:32643".to_string()),
    );
    geotiff::write(path, &raster)
}

/// Writes a deflate-compressed zip archive of `(name, contents)` entries.
pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
    let corrupt = |e: zip::result::ZipError| DemflowError::ArchiveCorrupt {
        archive: path.to_path_buf(),
        reason: e.to_string(),
    };
    let mut writer = zip::ZipWriter::new(std::fs::File::create(path)?);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, contents) in entries {
        writer.start_file(*name, options).map_err(corrupt)?;
        writer.write_all(contents)?;
    }
    writer.finish().map_err(corrupt)?;
    Ok(())
}
