//! Configuration types for jobs and the external toolchain.

use crate::coregistration::CoregistrationConfig;
use crate::crs::ProjectionChoice;
use crate::errors::{DemflowError, Result};
use crate::merge::MergeMode;
use crate::stages::StereoAlgorithm;
use crate::tools::{ToolCommand, ToolEnvironment, ToolRunner};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Processing parameters for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Output pixel size in CRS units.
    #[serde(default = "default_resolution")]
    pub resolution: f64,
    /// Output projection.
    #[serde(default)]
    pub projection: ProjectionChoice,
    /// Dense correlation algorithm.
    #[serde(default)]
    pub stereo_algorithm: StereoAlgorithm,
    /// Subpixel refinement level (1-3).
    #[serde(default = "default_subpixel_mode")]
    pub subpixel_mode: u8,
    /// Which rasters a multi-input job delivers.
    #[serde(default)]
    pub merge_mode: MergeMode,
    /// Coregistration method and tuning.
    #[serde(default)]
    pub coregistration: CoregistrationConfig,
    /// Number of inputs processed at once.
    #[serde(default = "default_max_concurrent_inputs")]
    pub max_concurrent_inputs: usize,
    /// Pattern of the imagery files expected inside an archive.
    #[serde(default = "default_input_pattern")]
    pub input_pattern: String,
    /// Parent directory for job scratch space. System temp dir when unset.
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
}

fn default_resolution() -> f64 {
    30.0
}

fn default_subpixel_mode() -> u8 {
    1
}

fn default_max_concurrent_inputs() -> usize {
    1
}

fn default_input_pattern() -> String {
    "*.tif".to_string()
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            projection: ProjectionChoice::default(),
            stereo_algorithm: StereoAlgorithm::default(),
            subpixel_mode: default_subpixel_mode(),
            merge_mode: MergeMode::default(),
            coregistration: CoregistrationConfig::default(),
            max_concurrent_inputs: default_max_concurrent_inputs(),
            input_pattern: default_input_pattern(),
            scratch_root: None,
        }
    }
}

impl JobConfig {
    /// Creates a job configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the output resolution.
    #[must_use]
    pub fn with_resolution(mut self, resolution: f64) -> Self {
        self.resolution = resolution;
        self
    }

    /// Sets the output projection.
    #[must_use]
    pub fn with_projection(mut self, projection: ProjectionChoice) -> Self {
        self.projection = projection;
        self
    }

    /// Sets the correlation algorithm.
    #[must_use]
    pub fn with_stereo_algorithm(mut self, algorithm: StereoAlgorithm) -> Self {
        self.stereo_algorithm = algorithm;
        self
    }

    /// Sets the subpixel level.
    #[must_use]
    pub fn with_subpixel_mode(mut self, mode: u8) -> Self {
        self.subpixel_mode = mode;
        self
    }

    /// Sets the merge mode.
    #[must_use]
    pub fn with_merge_mode(mut self, mode: MergeMode) -> Self {
        self.merge_mode = mode;
        self
    }

    /// Sets the coregistration configuration.
    #[must_use]
    pub fn with_coregistration(mut self, coregistration: CoregistrationConfig) -> Self {
        self.coregistration = coregistration;
        self
    }

    /// Sets the input concurrency.
    #[must_use]
    pub fn with_max_concurrent_inputs(mut self, n: usize) -> Self {
        self.max_concurrent_inputs = n;
        self
    }

    /// Sets the scratch root directory.
    #[must_use]
    pub fn with_scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(dir.into());
        self
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(DemflowError::config(format!(
                "resolution must be positive, got {}",
                self.resolution
            )));
        }
        if !(1..=3).contains(&self.subpixel_mode) {
            return Err(DemflowError::config(format!(
                "subpixel_mode must be 1-3, got {}",
                self.subpixel_mode
            )));
        }
        if self.max_concurrent_inputs == 0 {
            return Err(DemflowError::config("max_concurrent_inputs must be at least 1"));
        }
        if self.input_pattern.trim().is_empty() {
            return Err(DemflowError::config("input_pattern must not be empty"));
        }
        self.coregistration.validate()
    }
}

/// Programs, output patterns and limits of the external toolchain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Imagery to stereo-pair conversion tool.
    #[serde(default = "default_conversion_program")]
    pub conversion_program: String,
    /// Dense correlation tool.
    #[serde(default = "default_stereo_program")]
    pub stereo_program: String,
    /// Point cloud to raster tool.
    #[serde(default = "default_rasterization_program")]
    pub rasterization_program: String,
    /// Interpreter running the alignment script.
    #[serde(default = "default_alignment_interpreter")]
    pub alignment_interpreter: String,
    /// Alignment script path.
    #[serde(default = "default_alignment_script")]
    pub alignment_script: PathBuf,
    /// Output pattern of COP30 alignment.
    #[serde(default = "default_cop30_pattern")]
    pub cop30_output_pattern: String,
    /// Output pattern of ICESat-2 alignment.
    #[serde(default = "default_icesat2_pattern")]
    pub icesat2_output_pattern: String,
    /// Conversion timeout in seconds.
    #[serde(default = "default_conversion_timeout")]
    pub conversion_timeout_secs: u64,
    /// Correlation timeout in seconds.
    #[serde(default = "default_stereo_timeout")]
    pub stereo_timeout_secs: u64,
    /// Rasterization timeout in seconds.
    #[serde(default = "default_rasterization_timeout")]
    pub rasterization_timeout_secs: u64,
    /// Alignment timeout in seconds, per method.
    #[serde(default = "default_alignment_timeout")]
    pub alignment_timeout_secs: u64,
    /// Nodata value requested from the rasterization tool.
    #[serde(default = "default_nodata")]
    pub nodata_value: f64,
    /// Child process environment.
    #[serde(default)]
    pub environment: ToolEnvironment,
}

fn default_conversion_program() -> String {
    "aster2asp".to_string()
}

fn default_stereo_program() -> String {
    "stereo".to_string()
}

fn default_rasterization_program() -> String {
    "point2dem".to_string()
}

fn default_alignment_interpreter() -> String {
    "python3".to_string()
}

fn default_alignment_script() -> PathBuf {
    PathBuf::from("dem_coregistration.py")
}

fn default_cop30_pattern() -> String {
    "*COP30*DEM.tif".to_string()
}

fn default_icesat2_pattern() -> String {
    "*ICESat2*DEM.tif".to_string()
}

fn default_conversion_timeout() -> u64 {
    1800
}

fn default_stereo_timeout() -> u64 {
    3600
}

fn default_rasterization_timeout() -> u64 {
    1800
}

fn default_alignment_timeout() -> u64 {
    3600
}

fn default_nodata() -> f64 {
    crate::raster::DEFAULT_NODATA
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            conversion_program: default_conversion_program(),
            stereo_program: default_stereo_program(),
            rasterization_program: default_rasterization_program(),
            alignment_interpreter: default_alignment_interpreter(),
            alignment_script: default_alignment_script(),
            cop30_output_pattern: default_cop30_pattern(),
            icesat2_output_pattern: default_icesat2_pattern(),
            conversion_timeout_secs: default_conversion_timeout(),
            stereo_timeout_secs: default_stereo_timeout(),
            rasterization_timeout_secs: default_rasterization_timeout(),
            alignment_timeout_secs: default_alignment_timeout(),
            nodata_value: default_nodata(),
            environment: ToolEnvironment::default(),
        }
    }
}

impl ToolConfig {
    /// Creates a tool configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the alignment script.
    #[must_use]
    pub fn with_alignment_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.alignment_script = script.into();
        self
    }

    /// Sets the child environment.
    #[must_use]
    pub fn with_environment(mut self, environment: ToolEnvironment) -> Self {
        self.environment = environment;
        self
    }

    /// Sets the same timeout for every tool.
    #[must_use]
    pub fn with_uniform_timeout(mut self, secs: u64) -> Self {
        self.conversion_timeout_secs = secs;
        self.stereo_timeout_secs = secs;
        self.rasterization_timeout_secs = secs;
        self.alignment_timeout_secs = secs;
        self
    }

    /// Conversion timeout.
    #[must_use]
    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(self.conversion_timeout_secs)
    }

    /// Correlation timeout.
    #[must_use]
    pub fn stereo_timeout(&self) -> Duration {
        Duration::from_secs(self.stereo_timeout_secs)
    }

    /// Rasterization timeout.
    #[must_use]
    pub fn rasterization_timeout(&self) -> Duration {
        Duration::from_secs(self.rasterization_timeout_secs)
    }

    /// Alignment timeout.
    #[must_use]
    pub fn alignment_timeout(&self) -> Duration {
        Duration::from_secs(self.alignment_timeout_secs)
    }

    /// Checks that programs are named and limits are positive.
    pub fn validate(&self) -> Result<()> {
        let programs = [
            ("conversion_program", &self.conversion_program),
            ("stereo_program", &self.stereo_program),
            ("rasterization_program", &self.rasterization_program),
            ("alignment_interpreter", &self.alignment_interpreter),
        ];
        if let Some((name, _)) = programs.iter().find(|(_, p)| p.trim().is_empty()) {
            return Err(DemflowError::config(format!("{name} must not be empty")));
        }
        let timeouts = [
            ("conversion_timeout_secs", self.conversion_timeout_secs),
            ("stereo_timeout_secs", self.stereo_timeout_secs),
            ("rasterization_timeout_secs", self.rasterization_timeout_secs),
            ("alignment_timeout_secs", self.alignment_timeout_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, t)| *t == 0) {
            return Err(DemflowError::config(format!("{name} must be positive")));
        }
        if !self.nodata_value.is_finite() {
            return Err(DemflowError::config("nodata_value must be finite"));
        }
        Ok(())
    }

    /// Checks which tools can be launched and reports their versions.
    pub async fn probe(&self, runner: &dyn ToolRunner) -> Vec<ToolProbe> {
        let timeout = Duration::from_secs(30);
        let programs = [
            ("conversion", &self.conversion_program),
            ("stereo", &self.stereo_program),
            ("rasterization", &self.rasterization_program),
            ("alignment_interpreter", &self.alignment_interpreter),
        ];

        let mut probes = Vec::with_capacity(programs.len() + 1);
        for (role, program) in programs {
            let cmd = ToolCommand::new(program.as_str(), timeout).arg("--version");
            let probe = match runner.run(&cmd).await {
                Ok(outcome) => ToolProbe {
                    role: role.to_string(),
                    program: program.clone(),
                    available: !outcome.timed_out,
                    exit_code: outcome.exit_code,
                    version: first_line(&outcome.stdout).or_else(|| first_line(&outcome.stderr)),
                    error: outcome.timed_out.then(|| "timed out".to_string()),
                },
                Err(e) => ToolProbe {
                    role: role.to_string(),
                    program: program.clone(),
                    available: false,
                    exit_code: None,
                    version: None,
                    error: Some(e.to_string()),
                },
            };
            probes.push(probe);
        }

        let script_found = self.alignment_script.is_file();
        probes.push(ToolProbe {
            role: "alignment_script".to_string(),
            program: self.alignment_script.display().to_string(),
            available: script_found,
            exit_code: None,
            version: None,
            error: (!script_found).then(|| "file not found".to_string()),
        });
        probes
    }
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(ToString::to_string)
}

/// Availability of one tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolProbe {
    /// Role in the pipeline.
    pub role: String,
    /// Program that was probed.
    pub program: String,
    /// True if the program could be launched.
    pub available: bool,
    /// Exit code of the version query.
    pub exit_code: Option<i32>,
    /// First line of the version output.
    pub version: Option<String>,
    /// Why the tool is unavailable.
    pub error: Option<String>,
}

/// Complete configuration file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DemflowConfig {
    /// Job parameters.
    #[serde(default)]
    pub job: JobConfig,
    /// Toolchain settings.
    #[serde(default)]
    pub tools: ToolConfig,
}

impl DemflowConfig {
    /// Parses configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Serializes to pretty JSON. The API key is omitted.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes the configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }

    /// Validates both sections.
    pub fn validate(&self) -> Result<()> {
        self.job.validate()?;
        self.tools.validate()
    }
}
