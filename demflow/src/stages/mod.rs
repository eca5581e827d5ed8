//! Pipeline stages.
//!
//! Each stage validates its own artifact before reporting success, so a
//! stage never starts on a predecessor's unchecked output:
//!
//! - [`ExtractionStage`] unpacks an archive and finds the imagery
//! - [`ConversionStage`] builds the stereo pair and camera models
//! - [`StereoStage`] runs dense correlation into a point cloud
//! - [`RasterizationStage`] grids the point cloud into a DEM

mod context;
mod conversion;
mod extraction;
mod rasterization;
mod result;
mod scene;
mod sensor;
mod stereo;

pub use context::StageContext;
pub use conversion::{ConversionStage, StereoPair};
pub use extraction::{extract_archive, ExtractedInput, ExtractionStage};
pub use rasterization::{DemTile, RasterizationStage};
pub use result::StageResult;
pub use scene::locate_scene;
pub use sensor::SensorProfile;
pub use stereo::{PointCloud, StereoAlgorithm, StereoStage};

use crate::core::StageId;
use crate::errors::Result;
use crate::events::{STAGE_COMPLETED, STAGE_FAILED, STAGE_STARTED, STAGE_WARNED};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One validated unit of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// What the stage consumes.
    type Input: Send + 'static;
    /// What the stage produces once validated.
    type Output: StageArtifacts + Send;

    /// Returns the stage identifier.
    fn id(&self) -> StageId;

    /// Runs the stage to a validated output or a typed failure.
    async fn run(&self, ctx: &StageContext, input: Self::Input) -> Result<Self::Output>;

    /// Whether a failure of this stage stops the chain it belongs to.
    ///
    /// Non-fatal stages record a [`StageStatus::Warned`](crate::core::StageStatus) result.
    fn failure_is_fatal(&self) -> bool {
        true
    }
}

/// Files a stage output exposes in its [`StageResult`].
pub trait StageArtifacts {
    /// The artifact the next stage consumes.
    fn primary(&self) -> &Path;

    /// Additional artifacts worth reporting.
    fn secondary(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Tool output captured while producing the artifact.
    fn diagnostics(&self) -> &str {
        ""
    }
}

/// Runs a stage and records its result, emitting lifecycle events.
pub async fn execute_stage<S: Stage>(
    stage: &S,
    ctx: &StageContext,
    input: S::Input,
) -> (StageResult, Option<S::Output>) {
    let id = stage.id();
    let started_at = Utc::now();
    info!(stage = %id, input = ctx.input_index(), "Stage started");
    ctx.sink().try_emit(
        STAGE_STARTED,
        Some(serde_json::json!({"stage": id, "input": ctx.input_index()})),
    );

    match stage.run(ctx, input).await {
        Ok(output) => {
            let result = StageResult::succeeded(
                id,
                started_at,
                output.primary().to_path_buf(),
                output.secondary(),
                output.diagnostics(),
            );
            info!(
                stage = %id,
                input = ctx.input_index(),
                artifact = %output.primary().display(),
                duration_ms = crate::utils::millis(result.duration()),
                "Stage completed"
            );
            ctx.sink().try_emit(
                STAGE_COMPLETED,
                Some(serde_json::json!({
                    "stage": id,
                    "input": ctx.input_index(),
                    "artifacts": result.artifacts(),
                })),
            );
            (result, Some(output))
        }
        Err(err) => {
            let fatal = stage.failure_is_fatal();
            warn!(
                stage = %id,
                input = ctx.input_index(),
                code = err.code(),
                error = %err,
                fatal,
                "Stage failed"
            );
            let (event, result) = if fatal {
                (STAGE_FAILED, StageResult::failed(id, started_at, &err))
            } else {
                (STAGE_WARNED, StageResult::warned(id, started_at, &err))
            };
            ctx.sink().try_emit(
                event,
                Some(serde_json::json!({
                    "stage": id,
                    "input": ctx.input_index(),
                    "error": err.to_dict(),
                })),
            );
            (result, None)
        }
    }
}
