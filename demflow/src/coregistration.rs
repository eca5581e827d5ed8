//! Alignment of elevation rasters to reference sources.
//!
//! A [`CoregistrationEngine`] runs the alignment script once per reference
//! source. In ensemble mode the COP30 result feeds the ICESat-2 refinement,
//! and a failing refinement leaves the COP30 result in place.

use crate::core::StageId;
use crate::errors::{DemflowError, Result};
use crate::stages::{execute_stage, Stage, StageArtifacts, StageContext, StageResult};
use crate::tools::ToolCommand;
use crate::utils::FilePattern;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// An independent elevation reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSource {
    /// Copernicus 30 m global DEM.
    Cop30,
    /// ICESat-2 laser altimetry.
    Icesat2,
}

impl ReferenceSource {
    /// Value of the alignment script's `--method` argument.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cop30 => "cop30",
            Self::Icesat2 => "icesat2",
        }
    }

    /// Stage identifier of the alignment step.
    #[must_use]
    pub const fn stage_id(&self) -> StageId {
        match self {
            Self::Cop30 => StageId::CoregistrationCop30,
            Self::Icesat2 => StageId::CoregistrationIcesat2,
        }
    }

    /// Altimetry refinement failures never discard what came before.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Cop30)
    }
}

impl fmt::Display for ReferenceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which references a raster is aligned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoregistrationMethod {
    /// Align to COP30 only.
    #[default]
    Cop30,
    /// Align to ICESat-2 only.
    Icesat2,
    /// Align to COP30, then refine the result against ICESat-2.
    Ensemble,
}

impl CoregistrationMethod {
    /// The references in the order they run.
    #[must_use]
    pub const fn references(&self) -> &'static [ReferenceSource] {
        match self {
            Self::Cop30 => &[ReferenceSource::Cop30],
            Self::Icesat2 => &[ReferenceSource::Icesat2],
            Self::Ensemble => &[ReferenceSource::Cop30, ReferenceSource::Icesat2],
        }
    }
}

impl fmt::Display for CoregistrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cop30 => write!(f, "cop30"),
            Self::Icesat2 => write!(f, "icesat2"),
            Self::Ensemble => write!(f, "ensemble"),
        }
    }
}

impl FromStr for CoregistrationMethod {
    type Err = DemflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cop30" => Ok(Self::Cop30),
            "icesat2" | "icesat-2" => Ok(Self::Icesat2),
            "ensemble" => Ok(Self::Ensemble),
            other => Err(DemflowError::config(format!(
                "unknown coregistration method '{other}'"
            ))),
        }
    }
}

/// Coregistration method and tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoregistrationConfig {
    /// Method to run.
    #[serde(default)]
    pub method: CoregistrationMethod,
    /// Largest accepted shift, in metres.
    #[serde(default = "default_max_displacement")]
    pub max_displacement: f64,
    /// Fraction of points kept after outlier removal.
    #[serde(default = "default_outlier_ratio")]
    pub outlier_ratio: f64,
    /// Drop implausible elevations before COP30 alignment.
    #[serde(default = "default_elevation_filter")]
    pub elevation_filter: bool,
}

fn default_max_displacement() -> f64 {
    40.0
}

fn default_outlier_ratio() -> f64 {
    0.75
}

fn default_elevation_filter() -> bool {
    true
}

impl Default for CoregistrationConfig {
    fn default() -> Self {
        Self {
            method: CoregistrationMethod::default(),
            max_displacement: default_max_displacement(),
            outlier_ratio: default_outlier_ratio(),
            elevation_filter: default_elevation_filter(),
        }
    }
}

impl CoregistrationConfig {
    /// Creates a config for a method with default tuning.
    #[must_use]
    pub fn new(method: CoregistrationMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    /// Sets the maximum displacement.
    #[must_use]
    pub fn with_max_displacement(mut self, metres: f64) -> Self {
        self.max_displacement = metres;
        self
    }

    /// Sets the outlier retention ratio.
    #[must_use]
    pub fn with_outlier_ratio(mut self, ratio: f64) -> Self {
        self.outlier_ratio = ratio;
        self
    }

    /// Enables or disables the elevation filter.
    #[must_use]
    pub fn with_elevation_filter(mut self, enabled: bool) -> Self {
        self.elevation_filter = enabled;
        self
    }

    /// Checks the tuning ranges.
    pub fn validate(&self) -> Result<()> {
        if !(self.max_displacement.is_finite() && self.max_displacement > 0.0) {
            return Err(DemflowError::config(format!(
                "max_displacement must be positive, got {}",
                self.max_displacement
            )));
        }
        if !(self.outlier_ratio > 0.0 && self.outlier_ratio <= 1.0) {
            return Err(DemflowError::config(format!(
                "outlier_ratio must be in (0, 1], got {}",
                self.outlier_ratio
            )));
        }
        Ok(())
    }
}

/// The raster produced by one alignment step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedDem {
    /// The aligned raster.
    pub path: PathBuf,
    /// Captured tool output.
    pub diagnostics: String,
}

impl StageArtifacts for AlignedDem {
    fn primary(&self) -> &Path {
        &self.path
    }

    fn diagnostics(&self) -> &str {
        &self.diagnostics
    }
}

/// One invocation of the alignment script against one reference.
#[derive(Debug, Clone)]
pub struct AlignmentStep {
    reference: ReferenceSource,
    config: CoregistrationConfig,
    dir_name: String,
}

impl AlignmentStep {
    /// Creates a step writing into `<work_dir>/coreg_<reference>`.
    #[must_use]
    pub fn new(reference: ReferenceSource, config: CoregistrationConfig) -> Self {
        Self {
            reference,
            config,
            dir_name: format!("coreg_{reference}"),
        }
    }

    fn command(&self, ctx: &StageContext, dem: &Path, out_dir: &Path) -> ToolCommand {
        let tools = ctx.tools();
        let cmd = ToolCommand::new(tools.alignment_interpreter.as_str(), tools.alignment_timeout())
            .path_arg(&tools.alignment_script)
            .args(["--method", self.reference.as_str()])
            .arg("--dem-file")
            .path_arg(dem)
            .arg("--output-dir")
            .path_arg(out_dir)
            .arg("--max-displacement")
            .arg(self.config.max_displacement.to_string())
            .arg("--outlier-ratio")
            .arg(self.config.outlier_ratio.to_string());
        if self.reference == ReferenceSource::Cop30 && self.config.elevation_filter {
            cmd.arg("--elevation-filter")
        } else {
            cmd
        }
    }
}

#[async_trait]
impl Stage for AlignmentStep {
    type Input = PathBuf;
    type Output = AlignedDem;

    fn id(&self) -> StageId {
        self.reference.stage_id()
    }

    fn failure_is_fatal(&self) -> bool {
        self.reference.is_fatal()
    }

    async fn run(&self, ctx: &StageContext, dem: PathBuf) -> Result<AlignedDem> {
        let out_dir = ctx.stage_dir(&self.dir_name).await?;
        let cmd = self.command(ctx, &dem, &out_dir);

        let outcome = ctx
            .runner()
            .run(&cmd)
            .await?
            .require_completed(&cmd)?
            .require_success(&cmd)?;

        let pattern = match self.reference {
            ReferenceSource::Cop30 => &ctx.tools().cop30_output_pattern,
            ReferenceSource::Icesat2 => &ctx.tools().icesat2_output_pattern,
        };
        let path = FilePattern::new(pattern)?
            .find_first(&out_dir)?
            .ok_or_else(|| DemflowError::CoregistrationOutputMissing {
                pattern: pattern.clone(),
                dir: out_dir.clone(),
                diagnostics: outcome.diagnostics(),
            })?;

        Ok(AlignedDem {
            path,
            diagnostics: outcome.diagnostics(),
        })
    }
}

/// What a coregistration run produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoregistrationOutcome {
    /// The method that ran.
    pub method: CoregistrationMethod,
    /// The best aligned raster, if any step produced one that counts.
    pub artifact: Option<PathBuf>,
    /// One result per step that ran.
    pub steps: Vec<StageResult>,
    /// Non-fatal step failures.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl CoregistrationOutcome {
    /// Returns true if an aligned raster was produced.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.artifact.is_some()
    }
}

/// Runs a coregistration method.
#[derive(Debug, Clone, Default)]
pub struct CoregistrationEngine {
    config: CoregistrationConfig,
}

impl CoregistrationEngine {
    /// Creates an engine.
    #[must_use]
    pub const fn new(config: CoregistrationConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &CoregistrationConfig {
        &self.config
    }

    /// Aligns `dem`.
    ///
    /// A failing COP30 step yields no artifact and stops the chain. A failing
    /// ICESat-2 step is recorded as a warning and the previous artifact, if
    /// any, is kept.
    pub async fn run(&self, ctx: &StageContext, dem: &Path) -> CoregistrationOutcome {
        let method = self.config.method;
        let mut outcome = CoregistrationOutcome {
            method,
            artifact: None,
            steps: Vec::with_capacity(method.references().len()),
            warnings: Vec::new(),
        };
        let mut current = dem.to_path_buf();

        info!(method = %method, dem = %dem.display(), "Coregistration started");
        for &reference in method.references() {
            let step = AlignmentStep::new(reference, self.config.clone());
            let (result, aligned) = execute_stage(&step, ctx, current.clone()).await;
            let message = result.error_message().unwrap_or_default().to_string();
            outcome.steps.push(result);

            match aligned {
                Some(aligned) => {
                    current.clone_from(&aligned.path);
                    outcome.artifact = Some(aligned.path);
                }
                None if reference.is_fatal() => {
                    outcome.artifact = None;
                    break;
                }
                None => {
                    warn!(reference = %reference, error = %message, "Alignment refinement failed, keeping previous result");
                    outcome.warnings.push(format!("{reference} coregistration: {message}"));
                    break;
                }
            }
        }

        info!(
            method = %method,
            artifact = ?outcome.artifact,
            warnings = outcome.warnings.len(),
            "Coregistration finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolConfig;
    use crate::core::StageStatus;
    use crate::events::CollectingEventSink;
    use crate::testing::ScriptedToolRunner;
    use crate::tools::{MockToolRunner, ToolOutcome};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn arg_after<'a>(cmd: &'a ToolCommand, flag: &str) -> &'a str {
        let pos = cmd.args.iter().position(|a| a == flag).unwrap();
        &cmd.args[pos + 1]
    }

    /// Writes `<method>` named output into the step directory.
    fn aligning(cmd: &ToolCommand) -> ToolOutcome {
        let name = match arg_after(cmd, "--method") {
            "cop30" => "aligned_COP30_DEM.tif",
            _ => "aligned_ICESat2_DEM.tif",
        };
        std::fs::write(Path::new(arg_after(cmd, "--output-dir")).join(name), b"dem").unwrap();
        ToolOutcome::exited(0, "aligned", "")
    }

    fn context(work: &Path, runner: Arc<ScriptedToolRunner>) -> StageContext {
        StageContext::new(work, runner, Arc::new(ToolConfig::default()))
    }

    #[tokio::test]
    async fn test_ensemble_chains_cop30_into_icesat2() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedToolRunner::new().on("python3", aligning));
        let ctx = context(work.path(), runner.clone());
        let engine = CoregistrationEngine::new(CoregistrationConfig::new(CoregistrationMethod::Ensemble));

        let outcome = engine.run(&ctx, Path::new("/data/dem.tif")).await;

        let artifact = outcome.artifact.clone().unwrap();
        assert!(artifact.ends_with("coreg_icesat2/aligned_ICESat2_DEM.tif"));
        assert!(outcome.warnings.is_empty());
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(arg_after(&calls[0], "--dem-file"), "/data/dem.tif");
        assert!(arg_after(&calls[1], "--dem-file").ends_with("coreg_cop30/aligned_COP30_DEM.tif"));
        assert!(calls[0].args.iter().any(|a| a == "--elevation-filter"));
        assert!(!calls[1].args.iter().any(|a| a == "--elevation-filter"));
    }

    #[tokio::test]
    async fn test_ensemble_cop30_failure_never_runs_icesat2() {
        let work = tempfile::tempdir().unwrap();
        let mut mock = MockToolRunner::new();
        mock.expect_run()
            .times(1)
            .returning(|_| Ok(ToolOutcome::exited(1, "", "no reference tiles")));
        let ctx = StageContext::new(work.path(), Arc::new(mock), Arc::new(ToolConfig::default()));
        let engine = CoregistrationEngine::new(CoregistrationConfig::new(CoregistrationMethod::Ensemble));

        let outcome = engine.run(&ctx, Path::new("dem.tif")).await;

        assert!(outcome.artifact.is_none());
        assert_eq!(outcome.steps.len(), 1);
        assert_eq!(outcome.steps[0].status(), StageStatus::Failed);
        assert_eq!(outcome.steps[0].error_code(), Some("ToolFailed"));
    }

    #[tokio::test]
    async fn test_ensemble_icesat2_failure_keeps_cop30() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedToolRunner::new().on("python3", |cmd| {
            if arg_after(cmd, "--method") == "icesat2" {
                ToolOutcome::exited(2, "", "no ICESat-2 tracks over AOI")
            } else {
                aligning(cmd)
            }
        }));
        let sink = Arc::new(CollectingEventSink::new());
        let ctx = context(work.path(), runner).with_event_sink(sink.clone());
        let engine = CoregistrationEngine::new(CoregistrationConfig::new(CoregistrationMethod::Ensemble));

        let outcome = engine.run(&ctx, Path::new("dem.tif")).await;

        assert!(outcome.artifact.unwrap().ends_with("coreg_cop30/aligned_COP30_DEM.tif"));
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].starts_with("icesat2 coregistration"));
        assert_eq!(outcome.steps[1].status(), StageStatus::Warned);
        assert_eq!(sink.events_of_type("stage.warned").len(), 1);
        assert!(sink.events_of_type("stage.failed").is_empty());
    }

    #[tokio::test]
    async fn test_icesat2_only_failure_is_warning_without_artifact() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedToolRunner::new().on("python3", |_| ToolOutcome::exited(1, "", "timeout fetching ATL06")),
        );
        let ctx = context(work.path(), runner);
        let engine = CoregistrationEngine::new(CoregistrationConfig::new(CoregistrationMethod::Icesat2));

        let outcome = engine.run(&ctx, Path::new("dem.tif")).await;

        assert!(!outcome.succeeded());
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.steps[0].status(), StageStatus::Warned);
    }

    #[tokio::test]
    async fn test_success_without_output_is_missing() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedToolRunner::new().on("python3", |_| ToolOutcome::exited(0, "done", "")));
        let ctx = context(work.path(), runner);

        let err = AlignmentStep::new(ReferenceSource::Cop30, CoregistrationConfig::default())
            .run(&ctx, PathBuf::from("dem.tif"))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "CoregistrationOutputMissing");
        assert_eq!(err.diagnostics(), Some("done"));
    }

    #[tokio::test]
    async fn test_step_arguments() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedToolRunner::new().on("python3", aligning));
        let ctx = context(work.path(), runner.clone());
        let config = CoregistrationConfig::new(CoregistrationMethod::Cop30)
            .with_max_displacement(25.0)
            .with_outlier_ratio(0.5)
            .with_elevation_filter(false);

        AlignmentStep::new(ReferenceSource::Cop30, config)
            .run(&ctx, PathBuf::from("dem.tif"))
            .await
            .unwrap();

        let args = &runner.calls()[0].args;
        assert_eq!(args[0], "dem_coregistration.py");
        assert_eq!(arg_after(&runner.calls()[0], "--max-displacement"), "25");
        assert_eq!(arg_after(&runner.calls()[0], "--outlier-ratio"), "0.5");
        assert!(!args.iter().any(|a| a == "--elevation-filter"));
    }

    #[test]
    fn test_config_validation() {
        assert!(CoregistrationConfig::default().validate().is_ok());
        assert!(CoregistrationConfig::default().with_outlier_ratio(0.0).validate().is_err());
        assert!(CoregistrationConfig::default().with_outlier_ratio(1.0).validate().is_ok());
        assert!(CoregistrationConfig::default().with_max_displacement(-1.0).validate().is_err());
        assert!(CoregistrationConfig::default()
            .with_max_displacement(f64::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn test_method_parse_and_serde() {
        assert_eq!("ICESat-2".parse::<CoregistrationMethod>().unwrap(), CoregistrationMethod::Icesat2);
        assert!("lidar".parse::<CoregistrationMethod>().is_err());
        let config: CoregistrationConfig = serde_json::from_str(r#"{"method": "ensemble"}"#).unwrap();
        assert_eq!(config.method, CoregistrationMethod::Ensemble);
        assert_eq!(config.outlier_ratio, 0.75);
        assert!(config.elevation_filter);
    }
}
