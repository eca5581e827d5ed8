//! # Demflow
//!
//! Orchestration of stereo DEM reconstruction, tile merging and reference
//! coregistration.
//!
//! Demflow drives an external stereo toolchain through validated stages:
//!
//! - **Reconstruction**: archive extraction, stereo-pair conversion, dense
//!   correlation and point-cloud gridding, one chain per input
//! - **Merge**: max-elevation mosaicking of the per-input DEMs
//! - **Coregistration**: alignment to COP30, to ICESat-2, or both in sequence
//! - **Reporting**: a serializable job summary with raster statistics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use demflow::prelude::*;
//!
//! let config = DemflowConfig::from_file(Path::new("demflow.json"))?;
//! let runner = Arc::new(ProcessToolRunner::new(config.tools.environment.clone()));
//! let orchestrator = PipelineOrchestrator::new(runner, config.tools);
//!
//! let job = Job::new(JobMode::EndToEnd, inputs, config.job, "out")?;
//! let summary = orchestrator.run(job).await?;
//! ```

#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod coregistration;
pub mod core;
pub mod crs;
pub mod errors;
pub mod events;
pub mod merge;
pub mod observability;
pub mod pipeline;
pub mod raster;
pub mod stages;
pub mod testing;
pub mod tools;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{DemflowConfig, JobConfig, ToolConfig};
    pub use crate::coregistration::{
        CoregistrationConfig, CoregistrationEngine, CoregistrationMethod, CoregistrationOutcome,
    };
    pub use crate::core::{StageId, StageStatus};
    pub use crate::crs::{GeoPoint, ProjectionChoice};
    pub use crate::errors::{DemflowError, Result};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::merge::{MergeEngine, MergeMode, MergeRequest};
    pub use crate::pipeline::{ArtifactKind, Job, JobMode, JobSummary, PipelineOrchestrator};
    pub use crate::raster::{RasterArtifact, DEFAULT_NODATA};
    pub use crate::stages::{StageResult, StereoAlgorithm};
    pub use crate::tools::{ProcessToolRunner, ToolEnvironment, ToolRunner};
}
