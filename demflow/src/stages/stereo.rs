//! Dense stereo correlation.

use super::{SensorProfile, Stage, StageArtifacts, StageContext, StereoPair};
use crate::core::StageId;
use crate::crs::GeoPoint;
use crate::errors::{DemflowError, Result};
use crate::tools::ToolCommand;
use crate::utils::with_suffix;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Dense correlation algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StereoAlgorithm {
    /// Block matching.
    #[default]
    AspBm,
    /// Semi-global matching.
    AspSgm,
    /// More-global matching.
    AspMgm,
}

impl StereoAlgorithm {
    /// Returns the tool's name for the algorithm.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AspBm => "asp_bm",
            Self::AspSgm => "asp_sgm",
            Self::AspMgm => "asp_mgm",
        }
    }
}

impl fmt::Display for StereoAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StereoAlgorithm {
    type Err = DemflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asp_bm" | "bm" => Ok(Self::AspBm),
            "asp_sgm" | "sgm" => Ok(Self::AspSgm),
            "asp_mgm" | "mgm" => Ok(Self::AspMgm),
            other => Err(DemflowError::config(format!("unknown stereo algorithm '{other}'"))),
        }
    }
}

/// The validated point cloud.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    /// The `<prefix>-PC.tif` file.
    pub path: PathBuf,
    /// Scene centre carried over from conversion.
    pub scene_center: Option<GeoPoint>,
    /// Captured tool output.
    pub diagnostics: String,
}

impl StageArtifacts for PointCloud {
    fn primary(&self) -> &Path {
        &self.path
    }

    fn diagnostics(&self) -> &str {
        &self.diagnostics
    }
}

/// Runs the correlation tool on a stereo pair.
#[derive(Debug, Clone)]
pub struct StereoStage {
    sensor: SensorProfile,
    algorithm: StereoAlgorithm,
    subpixel_mode: u8,
}

impl StereoStage {
    /// Creates a stereo stage.
    #[must_use]
    pub const fn new(sensor: SensorProfile, algorithm: StereoAlgorithm, subpixel_mode: u8) -> Self {
        Self {
            sensor,
            algorithm,
            subpixel_mode,
        }
    }
}

#[async_trait]
impl Stage for StereoStage {
    type Input = StereoPair;
    type Output = PointCloud;

    fn id(&self) -> StageId {
        StageId::Stereo
    }

    async fn run(&self, ctx: &StageContext, pair: StereoPair) -> Result<PointCloud> {
        let tools = ctx.tools();
        let out_dir = ctx.stage_dir("stereo").await?;
        let prefix = out_dir.join("run");

        let cmd = ToolCommand::new(tools.stereo_program.as_str(), tools.stereo_timeout())
            .args(["-t", self.sensor.session()])
            .args(["--stereo-algorithm", self.algorithm.as_str()])
            .arg("--subpixel-mode")
            .arg(self.subpixel_mode.to_string())
            .path_arg(&pair.left_image)
            .path_arg(&pair.right_image)
            .path_arg(&pair.left_camera)
            .path_arg(&pair.right_camera)
            .path_arg(&prefix);

        let outcome = ctx.runner().run(&cmd).await?;
        if outcome.timed_out {
            return Err(DemflowError::StereoTimeout {
                timeout: cmd.timeout,
                diagnostics: outcome.diagnostics(),
            });
        }
        let outcome = outcome.require_success(&cmd)?;

        let path = with_suffix(&prefix, "-PC.tif");
        if !path.is_file() {
            return Err(DemflowError::PointCloudMissing {
                expected: path,
                diagnostics: outcome.diagnostics(),
            });
        }

        Ok(PointCloud {
            path,
            scene_center: pair.scene_center,
            diagnostics: outcome.diagnostics(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolConfig;
    use crate::testing::ScriptedToolRunner;
    use crate::tools::ToolOutcome;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn pair(dir: &Path) -> StereoPair {
        StereoPair {
            left_image: dir.join("out-Band3N.tif"),
            right_image: dir.join("out-Band3B.tif"),
            left_camera: dir.join("out-Band3N.xml"),
            right_camera: dir.join("out-Band3B.xml"),
            scene_center: Some(GeoPoint::new(77.4, 32.3)),
            diagnostics: String::new(),
        }
    }

    fn stage() -> StereoStage {
        StereoStage::new(SensorProfile::Aster, StereoAlgorithm::AspMgm, 3)
    }

    #[tokio::test]
    async fn test_arguments_and_point_cloud() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedToolRunner::new().on("stereo", |cmd| {
            let prefix = PathBuf::from(cmd.args.last().unwrap());
            std::fs::write(with_suffix(&prefix, "-PC.tif"), b"pc").unwrap();
            ToolOutcome::exited(0, "", "")
        }));
        let ctx = StageContext::new(work.path(), runner.clone(), Arc::new(ToolConfig::default()));

        let cloud = stage().run(&ctx, pair(work.path())).await.unwrap();

        assert!(cloud.path.ends_with("stereo/run-PC.tif"));
        assert_eq!(cloud.scene_center, Some(GeoPoint::new(77.4, 32.3)));
        let args = &runner.calls()[0].args;
        assert_eq!(
            args[..6],
            ["-t", "aster", "--stereo-algorithm", "asp_mgm", "--subpixel-mode", "3"]
        );
        assert!(args[6].ends_with("out-Band3N.tif"));
        assert!(args[9].ends_with("out-Band3B.xml"));
    }

    #[tokio::test]
    async fn test_missing_point_cloud() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedToolRunner::new().on("stereo", |_| ToolOutcome::exited(0, "correlated", "")),
        );
        let ctx = StageContext::new(work.path(), runner, Arc::new(ToolConfig::default()));

        let err = stage().run(&ctx, pair(work.path())).await.unwrap_err();

        assert_eq!(err.code(), "PointCloudMissing");
        assert_eq!(err.diagnostics(), Some("correlated"));
    }

    #[tokio::test]
    async fn test_timeout_is_stereo_timeout() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedToolRunner::new()
                .on("stereo", |_| ToolOutcome::killed_at_timeout("Correlation 40%", "")),
        );
        let ctx = StageContext::new(work.path(), runner, Arc::new(ToolConfig::default()));

        let err = stage().run(&ctx, pair(work.path())).await.unwrap_err();

        assert_eq!(err.code(), "StereoTimeout");
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_tool_failed() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedToolRunner::new().on("stereo", |_| ToolOutcome::exited(134, "", "std::bad_alloc")),
        );
        let ctx = StageContext::new(work.path(), runner, Arc::new(ToolConfig::default()));

        let err = stage().run(&ctx, pair(work.path())).await.unwrap_err();

        assert_eq!(err.code(), "ToolFailed");
        assert_eq!(err.diagnostics(), Some("std::bad_alloc"));
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("asp_sgm".parse::<StereoAlgorithm>().unwrap(), StereoAlgorithm::AspSgm);
        assert_eq!("MGM".parse::<StereoAlgorithm>().unwrap(), StereoAlgorithm::AspMgm);
        assert!("census".parse::<StereoAlgorithm>().is_err());
    }
}
