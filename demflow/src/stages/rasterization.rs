//! Point cloud to elevation raster.

use super::{PointCloud, Stage, StageArtifacts, StageContext};
use crate::core::StageId;
use crate::crs::ProjectionChoice;
use crate::errors::{DemflowError, Result};
use crate::tools::ToolCommand;
use crate::utils::with_suffix;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// The validated elevation raster of one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemTile {
    /// The `<prefix>-DEM.tif` file.
    pub dem: PathBuf,
    /// The triangulation error raster, when written.
    pub error_image: Option<PathBuf>,
    /// Projection the raster was written in.
    pub crs: String,
    /// Captured tool output.
    pub diagnostics: String,
}

impl StageArtifacts for DemTile {
    fn primary(&self) -> &Path {
        &self.dem
    }

    fn secondary(&self) -> Vec<PathBuf> {
        self.error_image.iter().cloned().collect()
    }

    fn diagnostics(&self) -> &str {
        &self.diagnostics
    }
}

/// Grids a point cloud at a resolution and projection.
#[derive(Debug, Clone)]
pub struct RasterizationStage {
    resolution: f64,
    projection: ProjectionChoice,
}

impl RasterizationStage {
    /// Creates a rasterization stage.
    #[must_use]
    pub const fn new(resolution: f64, projection: ProjectionChoice) -> Self {
        Self {
            resolution,
            projection,
        }
    }
}

#[async_trait]
impl Stage for RasterizationStage {
    type Input = PointCloud;
    type Output = DemTile;

    fn id(&self) -> StageId {
        StageId::Rasterization
    }

    async fn run(&self, ctx: &StageContext, cloud: PointCloud) -> Result<DemTile> {
        let crs = self.projection.resolve(cloud.scene_center)?;
        let tools = ctx.tools();
        let out_dir = ctx.stage_dir("dem").await?;
        let prefix = out_dir.join("dem");

        info!(input = ctx.input_index(), crs = %crs, resolution = self.resolution, "Gridding point cloud");

        let cmd = ToolCommand::new(tools.rasterization_program.as_str(), tools.rasterization_timeout())
            .path_arg(&cloud.path)
            .arg("-o")
            .path_arg(&prefix)
            .arg("--tr")
            .arg(self.resolution.to_string())
            .arg("--t_srs")
            .arg(crs.as_str())
            .arg("--nodata-value")
            .arg(tools.nodata_value.to_string())
            .arg("--errorimage");

        let outcome = ctx
            .runner()
            .run(&cmd)
            .await?
            .require_success(&cmd)?;

        let dem = with_suffix(&prefix, "-DEM.tif");
        if !dem.is_file() {
            return Err(DemflowError::RasterizationOutputMissing {
                expected: dem,
                diagnostics: outcome.diagnostics(),
            });
        }
        let error_image = Some(with_suffix(&prefix, "-IntersectionErr.tif")).filter(|p| p.is_file());

        Ok(DemTile {
            dem,
            error_image,
            crs,
            diagnostics: outcome.diagnostics(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolConfig;
    use crate::crs::GeoPoint;
    use crate::testing::ScriptedToolRunner;
    use crate::tools::ToolOutcome;
    use std::sync::Arc;

    fn cloud(dir: &Path, scene: Option<GeoPoint>) -> PointCloud {
        PointCloud {
            path: dir.join("run-PC.tif"),
            scene_center: scene,
            diagnostics: String::new(),
        }
    }

    fn writes_dem(cmd: &ToolCommand) -> ToolOutcome {
        let prefix = PathBuf::from(&cmd.args[2]);
        std::fs::write(with_suffix(&prefix, "-DEM.tif"), b"dem").unwrap();
        ToolOutcome::exited(0, "", "")
    }

    #[tokio::test]
    async fn test_auto_projection_arguments() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedToolRunner::new().on("point2dem", writes_dem));
        let ctx = StageContext::new(work.path(), runner.clone(), Arc::new(ToolConfig::default()));

        let tile = RasterizationStage::new(30.0, ProjectionChoice::Auto)
            .run(&ctx, cloud(work.path(), Some(GeoPoint::new(77.4, 32.3))))
            .await
            .unwrap();

        assert_eq!(tile.crs, "EPSG:32643");
        assert!(tile.dem.ends_with("dem/dem-DEM.tif"));
        assert!(tile.error_image.is_none());
        let args = &runner.calls()[0].args;
        assert_eq!(
            args[3..],
            ["--tr", "30", "--t_srs", "EPSG:32643", "--nodata-value", "-9999", "--errorimage"]
        );
    }

    #[tokio::test]
    async fn test_auto_without_scene_never_runs_tool() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedToolRunner::new().on("point2dem", writes_dem));
        let ctx = StageContext::new(work.path(), runner.clone(), Arc::new(ToolConfig::default()));

        let err = RasterizationStage::new(30.0, ProjectionChoice::Auto)
            .run(&ctx, cloud(work.path(), None))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "ProjectionUnresolved");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_error_image_reported() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedToolRunner::new().on("point2dem", |cmd| {
            let prefix = PathBuf::from(&cmd.args[2]);
            std::fs::write(with_suffix(&prefix, "-IntersectionErr.tif"), b"err").unwrap();
            writes_dem(cmd)
        }));
        let ctx = StageContext::new(work.path(), runner, Arc::new(ToolConfig::default()));

        let tile = RasterizationStage::new(10.0, ProjectionChoice::Geographic)
            .run(&ctx, cloud(work.path(), None))
            .await
            .unwrap();

        assert_eq!(tile.crs, "EPSG:4326");
        assert_eq!(tile.secondary().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_dem() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedToolRunner::new().on("point2dem", |_| ToolOutcome::exited(0, "", "")));
        let ctx = StageContext::new(work.path(), runner, Arc::new(ToolConfig::default()));

        let err = RasterizationStage::new(30.0, ProjectionChoice::Epsg(32633))
            .run(&ctx, cloud(work.path(), None))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "RasterizationOutputMissing");
    }
}
