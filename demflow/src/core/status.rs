//! Stage identifier and status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The pipeline step a result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Archive extraction.
    Extraction,
    /// Imagery to stereo-pair conversion.
    Conversion,
    /// Dense stereo correlation.
    Stereo,
    /// Point cloud to elevation raster.
    Rasterization,
    /// Multi-tile mosaic.
    Merge,
    /// Alignment against the dense global reference DEM.
    CoregistrationCop30,
    /// Alignment against the sparse altimetry reference.
    CoregistrationIcesat2,
}

impl StageId {
    /// Returns the per-input reconstruction chain in execution order.
    #[must_use]
    pub const fn reconstruction_chain() -> [Self; 4] {
        [
            Self::Extraction,
            Self::Conversion,
            Self::Stereo,
            Self::Rasterization,
        ]
    }

    /// Returns true for the coregistration steps.
    #[must_use]
    pub const fn is_coregistration(&self) -> bool {
        matches!(self, Self::CoregistrationCop30 | Self::CoregistrationIcesat2)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Extraction => write!(f, "extraction"),
            Self::Conversion => write!(f, "conversion"),
            Self::Stereo => write!(f, "stereo"),
            Self::Rasterization => write!(f, "rasterization"),
            Self::Merge => write!(f, "merge"),
            Self::CoregistrationCop30 => write!(f, "coregistration_cop30"),
            Self::CoregistrationIcesat2 => write!(f, "coregistration_icesat2"),
        }
    }
}

/// The terminal status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage produced a validated artifact.
    Succeeded,
    /// Stage failed; the owning pipeline stops.
    Failed,
    /// Stage failed but the failure is downgraded to a warning.
    Warned,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Warned => write!(f, "warned"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status indicates success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if the failure stops the owning pipeline.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Failed)
    }
}
