//! One end-to-end run and the scratch space it owns.

use crate::config::JobConfig;
use crate::errors::{DemflowError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uuid::Uuid;

/// What a job does with its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    /// Archives in, DEMs out.
    Reconstruction,
    /// Existing GeoTIFF DEMs in, aligned DEMs out.
    Coregistration,
    /// Archives in, reconstructed then aligned DEMs out.
    EndToEnd,
}

impl JobMode {
    /// Returns true if inputs are archives to reconstruct.
    #[must_use]
    pub const fn reconstructs(&self) -> bool {
        matches!(self, Self::Reconstruction | Self::EndToEnd)
    }

    /// Returns true if delivered DEMs are coregistered.
    #[must_use]
    pub const fn coregisters(&self) -> bool {
        matches!(self, Self::Coregistration | Self::EndToEnd)
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconstruction => write!(f, "reconstruction"),
            Self::Coregistration => write!(f, "coregistration"),
            Self::EndToEnd => write!(f, "end_to_end"),
        }
    }
}

/// A job: inputs, parameters and a scratch directory removed on drop.
#[derive(Debug)]
pub struct Job {
    id: Uuid,
    scratch: TempDir,
    inputs: Vec<PathBuf>,
    config: JobConfig,
    mode: JobMode,
    output_dir: PathBuf,
}

impl Job {
    /// Creates a job and its scratch directory.
    ///
    /// The scratch directory goes under `config.scratch_root` when set.
    pub fn new(
        mode: JobMode,
        inputs: Vec<PathBuf>,
        config: JobConfig,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        if inputs.is_empty() {
            return Err(DemflowError::config("a job needs at least one input"));
        }
        config.validate()?;

        let id = Uuid::new_v4();
        let prefix = format!("demflow-{}-", id.simple());
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let scratch = match &config.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        Ok(Self {
            id,
            scratch,
            inputs,
            config,
            mode,
            output_dir: output_dir.into(),
        })
    }

    /// Returns the job id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the scratch directory.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Returns the inputs in order.
    #[must_use]
    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    /// Returns the job parameters.
    #[must_use]
    pub const fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Returns the job mode.
    #[must_use]
    pub const fn mode(&self) -> JobMode {
        self.mode
    }

    /// Returns where deliverables are copied.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}
