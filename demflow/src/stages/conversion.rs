//! Imagery to stereo-pair conversion.

use super::{locate_scene, ExtractedInput, SensorProfile, Stage, StageArtifacts, StageContext};
use crate::core::StageId;
use crate::crs::GeoPoint;
use crate::errors::{DemflowError, Result};
use crate::tools::ToolCommand;
use crate::utils::FilePattern;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::warn;

/// The validated products of the conversion tool.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoPair {
    /// Nadir image.
    pub left_image: PathBuf,
    /// Backward-looking image.
    pub right_image: PathBuf,
    /// Nadir camera model.
    pub left_camera: PathBuf,
    /// Backward camera model.
    pub right_camera: PathBuf,
    /// Scene centre, when it could be determined.
    pub scene_center: Option<GeoPoint>,
    /// Captured tool output.
    pub diagnostics: String,
}

impl StageArtifacts for StereoPair {
    fn primary(&self) -> &Path {
        &self.left_image
    }

    fn secondary(&self) -> Vec<PathBuf> {
        vec![
            self.right_image.clone(),
            self.left_camera.clone(),
            self.right_camera.clone(),
        ]
    }

    fn diagnostics(&self) -> &str {
        &self.diagnostics
    }
}

/// Runs the conversion tool once and checks all four products exist.
#[derive(Debug, Clone, Default)]
pub struct ConversionStage {
    sensor: SensorProfile,
}

impl ConversionStage {
    /// Creates a conversion stage for a sensor.
    #[must_use]
    pub const fn new(sensor: SensorProfile) -> Self {
        Self { sensor }
    }
}

#[async_trait]
impl Stage for ConversionStage {
    type Input = ExtractedInput;
    type Output = StereoPair;

    fn id(&self) -> StageId {
        StageId::Conversion
    }

    async fn run(&self, ctx: &StageContext, input: ExtractedInput) -> Result<StereoPair> {
        let tools = ctx.tools();
        let out_dir = ctx.stage_dir("asp").await?;
        let prefix = out_dir.join("out");

        let cmd = ToolCommand::new(tools.conversion_program.as_str(), tools.conversion_timeout())
            .path_arg(&input.source_dir)
            .arg("-o")
            .path_arg(&prefix);
        let outcome = ctx.runner().run(&cmd).await?.require_completed(&cmd)?;
        if !outcome.success() {
            return Err(DemflowError::ConversionToolFailed {
                exit_code: outcome.exit_code,
                diagnostics: outcome.failure_diagnostics(),
            });
        }

        let mut found = Vec::with_capacity(4);
        let mut missing = Vec::new();
        for pattern in self.sensor.required_products() {
            match FilePattern::new(pattern)?.find_first(&out_dir)? {
                Some(path) => found.push(path),
                None => missing.push(pattern.to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(DemflowError::IncompleteConversionOutput {
                missing,
                diagnostics: outcome.diagnostics(),
            });
        }

        let [left_image, right_image, left_camera, right_camera]: [PathBuf; 4] = found
            .try_into()
            .map_err(|_| DemflowError::config("sensor profile must name four products"))?;

        let scene_center = locate_scene(&input.source_dir, Some(&left_camera));
        if scene_center.is_none() {
            warn!(
                input = ctx.input_index(),
                source_dir = %input.source_dir.display(),
                "Scene location not found; automatic projection will be unavailable"
            );
        }

        Ok(StereoPair {
            left_image,
            right_image,
            left_camera,
            right_camera,
            scene_center,
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
    use std::sync::Arc;

    fn input(dir: &Path) -> ExtractedInput {
        ExtractedInput {
            root: dir.to_path_buf(),
            source_dir: dir.to_path_buf(),
            files: Vec::new(),
        }
    }

    fn context(work: &Path, runner: Arc<ScriptedToolRunner>) -> StageContext {
        StageContext::new(work, runner, Arc::new(ToolConfig::default()))
    }

    #[tokio::test]
    async fn test_all_products_found() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedToolRunner::new().on("aster2asp", |cmd| {
            let prefix = PathBuf::from(cmd.args.last().unwrap());
            for suffix in ["-Band3N.tif", "-Band3B.tif", "-Band3N.xml", "-Band3B.xml"] {
                std::fs::write(crate::utils::with_suffix(&prefix, suffix), b"x").unwrap();
            }
            ToolOutcome::exited(0, "Writing: out-Band3N.tif", "")
        }));

        let pair = ConversionStage::default()
            .run(&context(work.path(), runner.clone()), input(work.path()))
            .await
            .unwrap();

        assert!(pair.left_image.ends_with("asp/out-Band3N.tif"));
        assert!(pair.right_camera.ends_with("asp/out-Band3B.xml"));
        assert_eq!(pair.diagnostics, "Writing: out-Band3N.tif");
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args[1], "-o");
    }

    #[tokio::test]
    async fn test_three_of_four_products_is_incomplete() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedToolRunner::new().on("aster2asp", |cmd| {
            let prefix = PathBuf::from(cmd.args.last().unwrap());
            for suffix in ["-Band3N.tif", "-Band3B.tif", "-Band3N.xml"] {
                std::fs::write(crate::utils::with_suffix(&prefix, suffix), b"x").unwrap();
            }
            ToolOutcome::exited(0, "", "")
        }));

        let err = ConversionStage::default()
            .run(&context(work.path(), runner), input(work.path()))
            .await
            .unwrap_err();

        match err {
            DemflowError::IncompleteConversionOutput { missing, .. } => {
                assert_eq!(missing, vec!["*Band3B.xml".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedToolRunner::new()
                .on("aster2asp", |_| {
                    ToolOutcome::exited(1, "Loading ASTER L1A images\n", "Could not find Band3N")
                }),
        );

        let err = ConversionStage::default()
            .run(&context(work.path(), runner), input(work.path()))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "ConversionToolFailed");
        assert_eq!(
            err.diagnostics(),
            Some("Loading ASTER L1A images\nCould not find Band3N")
        );
    }
}
