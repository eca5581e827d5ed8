//! Terminal record of one stage execution.

use crate::core::{StageId, StageStatus};
use crate::errors::DemflowError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What one stage produced, or why it did not.
///
/// A failed or warned result never carries an artifact; a succeeded result
/// always carries at least one. The constructors are the only way to build
/// one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    stage: StageId,
    status: StageStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    artifacts: Vec<PathBuf>,
    #[serde(skip_serializing_if = "String::is_empty")]
    diagnostics: String,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl StageResult {
    /// Creates a succeeded result with a primary artifact and any extras.
    #[must_use]
    pub fn succeeded(
        stage: StageId,
        started_at: DateTime<Utc>,
        primary: PathBuf,
        extra: Vec<PathBuf>,
        diagnostics: impl Into<String>,
    ) -> Self {
        let mut artifacts = Vec::with_capacity(extra.len() + 1);
        artifacts.push(primary);
        artifacts.extend(extra);
        Self::finish(stage, StageStatus::Succeeded, started_at, artifacts, diagnostics.into(), None)
    }

    /// Creates a failed result from the error that stopped the stage.
    #[must_use]
    pub fn failed(stage: StageId, started_at: DateTime<Utc>, error: &DemflowError) -> Self {
        Self::from_error(stage, StageStatus::Failed, started_at, error)
    }

    /// Creates a warned result: the stage failed but the job carries on.
    #[must_use]
    pub fn warned(stage: StageId, started_at: DateTime<Utc>, error: &DemflowError) -> Self {
        Self::from_error(stage, StageStatus::Warned, started_at, error)
    }

    fn from_error(
        stage: StageId,
        status: StageStatus,
        started_at: DateTime<Utc>,
        error: &DemflowError,
    ) -> Self {
        let diagnostics = error.diagnostics().unwrap_or_default().to_string();
        Self::finish(stage, status, started_at, Vec::new(), diagnostics, Some(error))
    }

    fn finish(
        stage: StageId,
        status: StageStatus,
        started_at: DateTime<Utc>,
        artifacts: Vec<PathBuf>,
        diagnostics: String,
        error: Option<&DemflowError>,
    ) -> Self {
        let ended_at = Utc::now().max(started_at);
        let duration_ms = u64::try_from((ended_at - started_at).num_milliseconds()).unwrap_or(0);
        Self {
            stage,
            status,
            artifacts,
            diagnostics,
            started_at,
            ended_at,
            duration_ms,
            error_code: error.map(|e| e.code().to_string()),
            error_message: error.map(ToString::to_string),
        }
    }

    /// Returns the stage identifier.
    #[must_use]
    pub const fn stage(&self) -> StageId {
        self.stage
    }

    /// Returns the terminal status.
    #[must_use]
    pub const fn status(&self) -> StageStatus {
        self.status
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns all produced artifacts, primary first.
    #[must_use]
    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    /// Returns the primary artifact.
    #[must_use]
    pub fn primary_artifact(&self) -> Option<&Path> {
        self.artifacts.first().map(PathBuf::as_path)
    }

    /// Returns the captured tool output.
    #[must_use]
    pub fn diagnostics(&self) -> &str {
        &self.diagnostics
    }

    /// Returns when the stage started.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns when the stage ended.
    #[must_use]
    pub const fn ended_at(&self) -> DateTime<Utc> {
        self.ended_at
    }

    /// Returns the elapsed time.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Returns the error code of a failed or warned stage.
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    /// Returns the error message of a failed or warned stage.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }
}
