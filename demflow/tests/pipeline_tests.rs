//! End-to-end jobs against the emulated toolchain.

use demflow::prelude::*;
use demflow::testing::{write_zip, CollectingEventSink, FakeToolchain};
use demflow::tools::ToolOutcome;
use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn archives(dir: &Path, n: usize) -> Vec<PathBuf> {
    (0..n)
        .map(|i| {
            let path = dir.join(format!("AST_L1A_00{i}.zip"));
            write_zip(
                &path,
                &[
                    ("AST_L1A_00/AST_L1A_00_Band3N.tif", b"nadir".as_slice()),
                    ("AST_L1A_00/AST_L1A_00_Band3B.tif", b"back".as_slice()),
                ],
            )
            .unwrap();
            path
        })
        .collect()
}

fn job(dir: &Path, mode: JobMode, inputs: Vec<PathBuf>, config: JobConfig) -> Job {
    Job::new(mode, inputs, config.with_scratch_root(dir.join("scratch")), dir.join("out")).unwrap()
}

#[tokio::test]
async fn test_three_tiles_merge_to_highest() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = FakeToolchain::default()
        .with_elevation_for("input_00", 100.0)
        .with_elevation_for("input_01", 150.0)
        .with_elevation_for("input_02", 200.0);
    let orchestrator = PipelineOrchestrator::new(Arc::new(toolchain.runner()), ToolConfig::default());
    let config = JobConfig::default()
        .with_merge_mode(MergeMode::MergedOnly)
        .with_max_concurrent_inputs(3);

    let summary = orchestrator
        .run(job(dir.path(), JobMode::Reconstruction, archives(dir.path(), 3), config))
        .await
        .unwrap();

    assert_eq!(summary.succeeded_inputs(), 3);
    assert_eq!(summary.artifacts.len(), 1);
    let merged = &summary.artifacts[0];
    assert_eq!(merged.kind, ArtifactKind::Merged);
    assert_eq!(merged.statistics[0].min, 200.0);
    assert_eq!(merged.statistics[0].max, 200.0);
    assert_eq!(merged.statistics[0].valid_pixels, merged.statistics[0].total_pixels);
}

#[tokio::test]
async fn test_inputs_keep_order_under_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = archives(dir.path(), 4);
    let orchestrator =
        PipelineOrchestrator::new(Arc::new(FakeToolchain::default().runner()), ToolConfig::default());

    let summary = orchestrator
        .run(job(
            dir.path(),
            JobMode::Reconstruction,
            inputs.clone(),
            JobConfig::default().with_max_concurrent_inputs(4),
        ))
        .await
        .unwrap();

    let reported: Vec<_> = summary.inputs.iter().map(|i| i.input.clone()).collect();
    assert_eq!(reported, inputs);
}

#[tokio::test]
async fn test_stereo_timeout_is_fatal_for_that_input_only() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = FakeToolchain::default().with_outcome(
        "stereo",
        "input_00",
        ToolOutcome::killed_at_timeout("Correlation 37%", ""),
    );
    let orchestrator = PipelineOrchestrator::new(Arc::new(toolchain.runner()), ToolConfig::default());

    let summary = orchestrator
        .run(job(dir.path(), JobMode::Reconstruction, archives(dir.path(), 2), JobConfig::default()))
        .await
        .unwrap();

    assert_eq!(summary.inputs[0].error_code.as_deref(), Some("StereoTimeout"));
    assert!(summary.inputs[1].succeeded());
    // A single surviving tile is copied, not merged.
    assert!(summary.merge.as_ref().unwrap().is_success());
    assert_eq!(summary.artifacts.len(), 2);
}

#[tokio::test]
async fn test_auto_projection_follows_scene() {
    let dir = tempfile::tempdir().unwrap();
    // Southern Patagonia: UTM 18S.
    let toolchain = FakeToolchain::default().with_scene(-73.2, -49.3);
    let runner = Arc::new(toolchain.runner());
    let orchestrator = PipelineOrchestrator::new(runner.clone(), ToolConfig::default());

    let summary = orchestrator
        .run(job(dir.path(), JobMode::Reconstruction, archives(dir.path(), 1), JobConfig::default()))
        .await
        .unwrap();

    assert_eq!(summary.artifacts[0].crs.as_deref(), Some("EPSG:32718"));
    let gridding = runner.calls_to("point2dem");
    assert!(gridding[0].args.iter().any(|a| a == "EPSG:32718"));
}

#[tokio::test]
async fn test_end_to_end_summary_serializes() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(CollectingEventSink::new());
    let orchestrator =
        PipelineOrchestrator::new(Arc::new(FakeToolchain::default().runner()), ToolConfig::default())
            .with_event_sink(sink.clone());
    let config = JobConfig::default()
        .with_coregistration(CoregistrationConfig::new(CoregistrationMethod::Ensemble));

    let summary = orchestrator
        .run(job(dir.path(), JobMode::EndToEnd, archives(dir.path(), 2), config))
        .await
        .unwrap();

    // Two individual DEMs plus the mosaic, each aligned.
    assert_eq!(summary.coregistration.len(), 3);
    assert_eq!(summary.artifacts_of(ArtifactKind::Coregistered).count(), 3);
    let json: serde_json::Value = serde_json::from_str(&summary.to_json_pretty().unwrap()).unwrap();
    assert_eq!(json["mode"], "end_to_end");
    assert_eq!(json["inputs"].as_array().unwrap().len(), 2);
    assert_eq!(json["merge"]["status"], "succeeded");
    assert_eq!(sink.events_of_type("job.completed").len(), 1);
}
