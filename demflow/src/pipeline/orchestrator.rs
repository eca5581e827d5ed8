//! Job execution: per-input chains, merge and coregistration barriers,
//! delivery.

use super::summary::{ArtifactKind, ArtifactReport, CoregistrationReport, InputReport, JobSummary};
use super::{Job, JobMode};
use crate::config::{JobConfig, ToolConfig};
use crate::coregistration::CoregistrationEngine;
use crate::errors::Result;
use crate::events::{EventSink, NoOpEventSink, JOB_COMPLETED, JOB_STARTED};
use crate::merge::{MergeEngine, MergeRequest};
use crate::raster::RasterArtifact;
use crate::stages::{
    execute_stage, ConversionStage, ExtractionStage, RasterizationStage, SensorProfile, Stage,
    StageContext, StageResult, StereoStage,
};
use crate::tools::ToolRunner;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// File name of the merged DEM.
pub const MERGED_DEM_NAME: &str = "merged_dem.tif";

/// The four reconstruction stages built from one job config.
struct ReconstructionChain {
    extraction: ExtractionStage,
    conversion: ConversionStage,
    stereo: StereoStage,
    rasterization: RasterizationStage,
}

impl ReconstructionChain {
    fn new(config: &JobConfig) -> Result<Self> {
        let sensor = SensorProfile::default();
        Ok(Self {
            extraction: ExtractionStage::new(&config.input_pattern)?,
            conversion: ConversionStage::new(sensor),
            stereo: StereoStage::new(sensor, config.stereo_algorithm, config.subpixel_mode),
            rasterization: RasterizationStage::new(config.resolution, config.projection),
        })
    }
}

/// A DEM that will be delivered and possibly aligned.
#[derive(Debug, Clone)]
struct Deliverable {
    kind: ArtifactKind,
    label: String,
    source: PathBuf,
}

/// Runs stage outputs into `results`; `None` stops the chain.
async fn record<S: Stage>(
    results: &mut Vec<StageResult>,
    stage: &S,
    ctx: &StageContext,
    input: S::Input,
) -> Option<S::Output> {
    let (result, output) = execute_stage(stage, ctx, input).await;
    results.push(result);
    output
}

/// Sequences stages for whole jobs.
pub struct PipelineOrchestrator {
    runner: Arc<dyn ToolRunner>,
    tools: Arc<ToolConfig>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(runner: Arc<dyn ToolRunner>, tools: ToolConfig) -> Self {
        Self {
            runner,
            tools: Arc::new(tools),
            sink: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the toolchain configuration.
    #[must_use]
    pub fn tools(&self) -> &ToolConfig {
        &self.tools
    }

    fn context(&self, work_dir: PathBuf, index: usize) -> StageContext {
        StageContext::new(work_dir, Arc::clone(&self.runner), Arc::clone(&self.tools))
            .with_input_index(index)
            .with_event_sink(Arc::clone(&self.sink))
    }

    /// Runs a job to completion.
    ///
    /// Per-input failures are recorded in the summary. Only configuration
    /// and output-directory errors fail the call itself. The job's scratch
    /// directory is removed when this returns.
    pub async fn run(&self, job: Job) -> Result<JobSummary> {
        self.tools.validate()?;
        let config = job.config();
        let chain = ReconstructionChain::new(config)?;
        tokio::fs::create_dir_all(job.output_dir()).await?;

        let started_at = Utc::now();
        info!(
            job_id = %job.id(),
            mode = %job.mode(),
            inputs = job.inputs().len(),
            "Job started"
        );
        self.sink
            .emit(
                JOB_STARTED,
                Some(serde_json::json!({
                    "job_id": job.id(),
                    "mode": job.mode(),
                    "inputs": job.inputs().len(),
                })),
            )
            .await;

        let mut warnings = Vec::new();
        let inputs = if job.mode().reconstructs() {
            self.reconstruct_all(&job, &chain).await
        } else {
            Self::open_existing(&job)
        };

        let merge = if job.mode().reconstructs() {
            self.merge(&job, &inputs).await
        } else {
            None
        };

        let deliverables = Self::deliverables(&job, &inputs, merge.as_ref(), &mut warnings);

        let mut coregistration = Vec::new();
        // Coregistration mode delivers only aligned rasters.
        let mut delivered = if job.mode().reconstructs() {
            deliverables.clone()
        } else {
            Vec::new()
        };
        if job.mode().coregisters() {
            coregistration = self.coregister_all(&job, &deliverables).await;
            for report in &coregistration {
                warnings.extend(report.outcome.warnings.iter().map(|w| format!("{}: {w}", report.target)));
                if let Some(aligned) = &report.outcome.artifact {
                    delivered.push(Deliverable {
                        kind: ArtifactKind::Coregistered,
                        label: report.target.clone(),
                        source: aligned.clone(),
                    });
                }
            }
        }

        let mut artifacts = Vec::with_capacity(delivered.len());
        for item in &delivered {
            match Self::deliver(job.output_dir(), item).await {
                Ok(report) => artifacts.push(report),
                Err(e) => {
                    warn!(label = %item.label, error = %e, "Delivery failed");
                    warnings.push(format!("{}: delivery failed: {e}", item.label));
                }
            }
        }

        let summary = JobSummary {
            job_id: job.id(),
            mode: job.mode(),
            started_at,
            ended_at: Utc::now(),
            inputs,
            merge,
            coregistration,
            artifacts,
            warnings,
        };

        info!(
            job_id = %summary.job_id,
            succeeded_inputs = summary.succeeded_inputs(),
            artifacts = summary.artifacts.len(),
            warnings = summary.warnings.len(),
            "Job completed"
        );
        self.sink
            .emit(
                JOB_COMPLETED,
                Some(serde_json::json!({
                    "job_id": summary.job_id,
                    "succeeded": summary.succeeded(),
                    "succeeded_inputs": summary.succeeded_inputs(),
                    "artifacts": summary.artifacts.iter().map(|a| &a.path).collect::<Vec<_>>(),
                    "warnings": summary.warnings.len(),
                })),
            )
            .await;
        Ok(summary)
    }

    async fn reconstruct_all(&self, job: &Job, chain: &ReconstructionChain) -> Vec<InputReport> {
        let limit = job.config().max_concurrent_inputs.max(1);
        stream::iter(job.inputs().iter().cloned().enumerate())
            .map(|(index, input)| self.reconstruct(job.work_dir(), chain, index, input))
            .buffered(limit)
            .collect()
            .await
    }

    async fn reconstruct(
        &self,
        work_dir: &Path,
        chain: &ReconstructionChain,
        index: usize,
        input: PathBuf,
    ) -> InputReport {
        let ctx = self.context(work_dir.join(format!("input_{index:02}")), index);
        let mut results = Vec::with_capacity(4);
        let dem = async {
            let extracted = record(&mut results, &chain.extraction, &ctx, input.clone()).await?;
            let pair = record(&mut results, &chain.conversion, &ctx, extracted).await?;
            let cloud = record(&mut results, &chain.stereo, &ctx, pair).await?;
            let tile = record(&mut results, &chain.rasterization, &ctx, cloud).await?;
            Some(tile.dem)
        }
        .await;

        if dem.is_none() {
            warn!(input = index, path = %input.display(), "Input stopped before producing a DEM");
        }
        InputReport::new(index, input, results, dem)
    }

    /// Coregistration mode: each input is an existing DEM, checked to open.
    fn open_existing(job: &Job) -> Vec<InputReport> {
        job.inputs()
            .iter()
            .enumerate()
            .map(|(index, input)| match RasterArtifact::open(input) {
                Ok(_) => InputReport::new(index, input.clone(), Vec::new(), Some(input.clone())),
                Err(e) => {
                    warn!(input = index, error = %e, "Coregistration input is not a readable raster");
                    let mut report = InputReport::new(index, input.clone(), Vec::new(), None);
                    report.error_code = Some(e.code().to_string());
                    report.error_message = Some(e.to_string());
                    report
                }
            })
            .collect()
    }

    async fn merge(&self, job: &Job, inputs: &[InputReport]) -> Option<StageResult> {
        if inputs.len() < 2 || !job.config().merge_mode.merges() {
            return None;
        }
        let ctx = self.context(job.work_dir().join("merge"), inputs.len());
        if let Err(e) = tokio::fs::create_dir_all(ctx.work_dir()).await {
            warn!(error = %e, "Cannot create merge directory");
        }
        let tiles = inputs.iter().filter_map(|i| i.dem.clone()).collect();
        let request = MergeRequest::new(tiles, ctx.work_dir().join(MERGED_DEM_NAME));
        let (result, _) = execute_stage(&MergeEngine::new(), &ctx, request).await;
        Some(result)
    }

    fn deliverables(
        job: &Job,
        inputs: &[InputReport],
        merge: Option<&StageResult>,
        warnings: &mut Vec<String>,
    ) -> Vec<Deliverable> {
        if !job.mode().reconstructs() {
            return inputs
                .iter()
                .filter_map(|i| {
                    i.dem.clone().map(|source| Deliverable {
                        kind: ArtifactKind::Individual,
                        label: i.label(),
                        source,
                    })
                })
                .collect();
        }

        let mode = job.config().merge_mode;
        let mut out = Vec::new();
        // Without a merge there is nothing else to deliver.
        if mode.delivers_individual() || merge.is_none() {
            out.extend(inputs.iter().filter_map(|i| {
                i.dem.clone().map(|source| Deliverable {
                    kind: ArtifactKind::Individual,
                    label: i.label(),
                    source,
                })
            }));
        }
        if let Some(result) = merge {
            match result.primary_artifact() {
                Some(path) => out.push(Deliverable {
                    kind: ArtifactKind::Merged,
                    label: "merged".to_string(),
                    source: path.to_path_buf(),
                }),
                None => warnings.push(format!(
                    "merge failed: {}",
                    result.error_message().unwrap_or("unknown error")
                )),
            }
        }
        out
    }

    async fn coregister_all(&self, job: &Job, targets: &[Deliverable]) -> Vec<CoregistrationReport> {
        let engine = CoregistrationEngine::new(job.config().coregistration.clone());
        let limit = job.config().max_concurrent_inputs.max(1);
        let base = job.work_dir().join("coregistration");
        stream::iter(targets.iter().enumerate())
            .map(|(index, target)| {
                let ctx = self.context(base.join(&target.label), index);
                let engine = &engine;
                async move {
                    let outcome = engine.run(&ctx, &target.source).await;
                    CoregistrationReport {
                        target: target.label.clone(),
                        outcome,
                    }
                }
            })
            .buffered(limit)
            .collect()
            .await
    }

    async fn deliver(output_dir: &Path, item: &Deliverable) -> Result<ArtifactReport> {
        let file_name = item
            .source
            .file_name()
            .map_or_else(|| "dem.tif".into(), |n| n.to_string_lossy());
        let name = match item.kind {
            ArtifactKind::Merged => MERGED_DEM_NAME.to_string(),
            ArtifactKind::Individual | ArtifactKind::Coregistered => {
                format!("{}_{file_name}", item.label)
            }
        };
        let dest = output_dir.join(name);
        tokio::fs::copy(&item.source, &dest).await?;

        let kind = item.kind;
        tokio::task::spawn_blocking(move || ArtifactReport::build(kind, &dest))
            .await
            .map_err(|e| crate::errors::DemflowError::Io(std::io::Error::other(e)))?
    }
}
