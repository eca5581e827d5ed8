//! Core domain model types for demflow.
//!
//! This module contains the identifiers shared by every stage and the
//! orchestrator:
//! - Stage identifiers in pipeline order
//! - Terminal stage statuses

mod status;

pub use status::{StageId, StageStatus};
