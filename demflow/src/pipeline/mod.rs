//! Job orchestration.
//!
//! This module provides:
//! - [`Job`] with its mode, inputs and scratch directory
//! - [`PipelineOrchestrator`] running inputs through the stage chain, the
//!   merge and the coregistration
//! - [`JobSummary`] describing what was delivered

mod job;
mod orchestrator;
mod summary;

pub use job::{Job, JobMode};
pub use orchestrator::{PipelineOrchestrator, MERGED_DEM_NAME};
pub use summary::{ArtifactKind, ArtifactReport, CoregistrationReport, InputReport, JobSummary};
