//! Serializable record of a finished job.

use super::JobMode;
use crate::coregistration::CoregistrationOutcome;
use crate::errors::Result;
use crate::raster::{BandStatistics, Bounds, RasterArtifact};
use crate::stages::StageResult;
use crate::utils::sha256_file;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// What one input went through.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputReport {
    /// Position in the job's input list.
    pub index: usize,
    /// The input path as given.
    pub input: PathBuf,
    /// Results of the stages that ran, in order.
    pub stages: Vec<StageResult>,
    /// The input's DEM in scratch space, when one was produced.
    #[serde(skip)]
    pub dem: Option<PathBuf>,
    /// Error code of the stage that stopped this input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Error message of the stage that stopped this input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl InputReport {
    pub(crate) fn new(index: usize, input: PathBuf, stages: Vec<StageResult>, dem: Option<PathBuf>) -> Self {
        let failed = stages.iter().find(|r| r.status().is_fatal());
        Self {
            index,
            input,
            error_code: failed.and_then(|r| r.error_code()).map(str::to_string),
            error_message: failed.and_then(|r| r.error_message()).map(str::to_string),
            stages,
            dem,
        }
    }

    /// Returns true if the input produced a DEM.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.dem.is_some()
    }

    /// Short name used for the input's directories and deliverables.
    #[must_use]
    pub fn label(&self) -> String {
        format!("input_{:02}", self.index)
    }
}

/// The kind of a delivered raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// One input's reconstruction.
    Individual,
    /// The mosaic of all inputs.
    Merged,
    /// An aligned raster.
    Coregistered,
}

/// Metadata and statistics of a delivered raster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactReport {
    /// Kind of raster.
    pub kind: ArtifactKind,
    /// Delivered path.
    pub path: PathBuf,
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// CRS identifier.
    pub crs: Option<String>,
    /// Spatial bounds.
    pub bounds: Bounds,
    /// Nodata sentinel.
    pub nodata: Option<f64>,
    /// Per-band elevation statistics.
    pub statistics: Vec<BandStatistics>,
    /// File size in bytes.
    pub file_size: u64,
    /// Hex SHA-256 of the file.
    pub sha256: String,
}

impl ArtifactReport {
    /// Reads a delivered raster and builds its report.
    pub fn build(kind: ArtifactKind, path: &Path) -> Result<Self> {
        let artifact = RasterArtifact::open(path)?;
        let (width, height) = artifact.dimensions();
        Ok(Self {
            kind,
            path: path.to_path_buf(),
            width,
            height,
            crs: artifact.crs().map(str::to_string),
            bounds: artifact.bounds(),
            nodata: artifact.nodata(),
            statistics: artifact.statistics()?.to_vec(),
            file_size: std::fs::metadata(path)?.len(),
            sha256: sha256_file(path)?,
        })
    }
}

/// Coregistration of one delivered DEM.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoregistrationReport {
    /// Which DEM was aligned, such as `input_00` or `merged`.
    pub target: String,
    /// What the engine produced.
    pub outcome: CoregistrationOutcome,
}

/// Everything a job produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    /// Job id.
    pub job_id: Uuid,
    /// Job mode.
    pub mode: JobMode,
    /// When the job started.
    pub started_at: DateTime<Utc>,
    /// When the job ended.
    pub ended_at: DateTime<Utc>,
    /// Per-input outcomes, in input order.
    pub inputs: Vec<InputReport>,
    /// Merge result, when a merge ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<StageResult>,
    /// Coregistration outcomes, one per aligned DEM.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub coregistration: Vec<CoregistrationReport>,
    /// Delivered rasters.
    pub artifacts: Vec<ArtifactReport>,
    /// Non-fatal problems.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl JobSummary {
    /// Returns true if at least one raster was delivered.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.artifacts.is_empty()
    }

    /// Number of inputs that produced a DEM.
    #[must_use]
    pub fn succeeded_inputs(&self) -> usize {
        self.inputs.iter().filter(|i| i.succeeded()).count()
    }

    /// Delivered artifacts of one kind.
    pub fn artifacts_of(&self, kind: ArtifactKind) -> impl Iterator<Item = &ArtifactReport> {
        self.artifacts.iter().filter(move |a| a.kind == kind)
    }

    /// Serializes the summary as pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageId;
    use crate::errors::DemflowError;
    use crate::testing::write_flat_dem;

    #[test]
    fn test_input_report_takes_fatal_error() {
        let err = DemflowError::StereoTimeout {
            timeout: std::time::Duration::from_secs(3600),
            diagnostics: String::new(),
        };
        let stages = vec![
            StageResult::succeeded(StageId::Extraction, Utc::now(), "x".into(), Vec::new(), ""),
            StageResult::failed(StageId::Stereo, Utc::now(), &err),
        ];
        let report = InputReport::new(3, "scene.zip".into(), stages, None);

        assert!(!report.succeeded());
        assert_eq!(report.error_code.as_deref(), Some("StereoTimeout"));
        assert_eq!(report.label(), "input_03");
    }

    #[test]
    fn test_artifact_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dem.tif");
        write_flat_dem(&path, 5, 4, 1234.5).unwrap();

        let report = ArtifactReport::build(ArtifactKind::Individual, &path).unwrap();

        assert_eq!((report.width, report.height), (5, 4));
        assert_eq!(report.crs.as_deref(), Some("EPSG:32643"));
        assert_eq!(report.statistics[0].valid_pixels, 20);
        assert_eq!(report.statistics[0].mean, 1234.5);
        assert_eq!(report.sha256.len(), 64);
        assert_eq!(report.file_size, std::fs::metadata(&path).unwrap().len());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "individual");
    }
}
