//! Error types for the demflow pipeline.
//!
//! Every failure a stage can produce is a variant of [`DemflowError`]. Variants
//! raised after an external tool ran keep that tool's captured output so the
//! caller can show it verbatim.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = DemflowError> = std::result::Result<T, E>;

/// The main error type for demflow operations.
#[derive(Debug, Error)]
pub enum DemflowError {
    /// An external tool did not exit within its timeout and was killed.
    #[error("Tool '{program}' timed out after {}s", timeout.as_secs_f64())]
    ToolTimeout {
        /// The program that was running.
        program: String,
        /// The timeout that elapsed.
        timeout: Duration,
        /// Output captured before the process was killed.
        diagnostics: String,
    },

    /// An external tool could not be started.
    #[error("Failed to launch '{program}': {source}")]
    ToolLaunch {
        /// The program that failed to start.
        program: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// An external tool exited with a non-zero status.
    #[error("Tool '{program}' failed with exit code {}", display_exit_code(*exit_code))]
    ToolFailed {
        /// The program that failed.
        program: String,
        /// The exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Tail of standard output followed by standard error.
        diagnostics: String,
    },

    /// The input archive could not be opened or read.
    #[error("Archive {} is corrupt: {reason}", archive.display())]
    ArchiveCorrupt {
        /// The archive path.
        archive: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// No expected input file was found after extraction.
    #[error("No file matching '{pattern}' found in {}", dir.display())]
    NoInputFound {
        /// The extraction directory that was searched.
        dir: PathBuf,
        /// The pattern that was searched for.
        pattern: String,
    },

    /// The conversion tool reported success but some products are missing.
    #[error("Conversion output incomplete, missing: {}", missing.join(", "))]
    IncompleteConversionOutput {
        /// Patterns of the products that were not found.
        missing: Vec<String>,
        /// Captured tool output.
        diagnostics: String,
    },

    /// The conversion tool exited with a non-zero status.
    #[error("Conversion tool failed with exit code {}", display_exit_code(*exit_code))]
    ConversionToolFailed {
        /// The exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Tail of standard output followed by standard error.
        diagnostics: String,
    },

    /// The correlation tool did not produce the point cloud.
    #[error("Point cloud not found at {}", expected.display())]
    PointCloudMissing {
        /// Where the point cloud was expected.
        expected: PathBuf,
        /// Captured tool output.
        diagnostics: String,
    },

    /// The correlation tool timed out.
    #[error("Stereo correlation timed out after {}s", timeout.as_secs_f64())]
    StereoTimeout {
        /// The timeout that elapsed.
        timeout: Duration,
        /// Output captured before the process was killed.
        diagnostics: String,
    },

    /// The raster generation tool did not produce the elevation raster.
    #[error("Elevation raster not found at {}", expected.display())]
    RasterizationOutputMissing {
        /// Where the DEM was expected.
        expected: PathBuf,
        /// Captured tool output.
        diagnostics: String,
    },

    /// Tiles passed to the merge do not share a compatible grid.
    #[error("Tile {} is incompatible with the mosaic: {reason}", tile.display())]
    IncompatibleTileGeometry {
        /// The offending tile.
        tile: PathBuf,
        /// What differs.
        reason: String,
    },

    /// No merge input exists on disk.
    #[error("No valid tiles to merge")]
    NoValidTiles,

    /// The alignment tool reported success but no output raster matched.
    #[error("Coregistration output matching '{pattern}' not found in {}", dir.display())]
    CoregistrationOutputMissing {
        /// Method-specific output pattern.
        pattern: String,
        /// Directory that was searched.
        dir: PathBuf,
        /// Captured tool output.
        diagnostics: String,
    },

    /// Automatic projection was requested but the scene location is unknown.
    #[error("Cannot resolve projection: {reason}")]
    ProjectionUnresolved {
        /// Why no projection could be derived.
        reason: String,
    },

    /// A raster could not be read or written.
    #[error("Raster error for {}: {reason}", path.display())]
    Raster {
        /// The raster path.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_exit_code(code: Option<i32>) -> String {
    code.map_or_else(|| "none (terminated by signal)".to_string(), |c| c.to_string())
}

impl DemflowError {
    /// Creates a raster error.
    #[must_use]
    pub fn raster(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Raster {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates an incompatible tile error.
    #[must_use]
    pub fn incompatible_tile(tile: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::IncompatibleTileGeometry {
            tile: tile.into(),
            reason: reason.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns a stable identifier for the error kind.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ToolTimeout { .. } => "ToolTimeout",
            Self::ToolLaunch { .. } => "ToolLaunchError",
            Self::ToolFailed { .. } => "ToolFailed",
            Self::ArchiveCorrupt { .. } => "ArchiveCorrupt",
            Self::NoInputFound { .. } => "NoInputFound",
            Self::IncompleteConversionOutput { .. } => "IncompleteConversionOutput",
            Self::ConversionToolFailed { .. } => "ConversionToolFailed",
            Self::PointCloudMissing { .. } => "PointCloudMissing",
            Self::StereoTimeout { .. } => "StereoTimeout",
            Self::RasterizationOutputMissing { .. } => "RasterizationOutputMissing",
            Self::IncompatibleTileGeometry { .. } => "IncompatibleTileGeometry",
            Self::NoValidTiles => "NoValidTiles",
            Self::CoregistrationOutputMissing { .. } => "CoregistrationOutputMissing",
            Self::ProjectionUnresolved { .. } => "ProjectionUnresolved",
            Self::Raster { .. } => "RasterError",
            Self::Config(_) => "ConfigError",
            Self::Serialization(_) => "SerializationError",
            Self::Io(_) => "IoError",
        }
    }

    /// Returns the captured tool output attached to this error, if any.
    #[must_use]
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::ToolTimeout { diagnostics, .. }
            | Self::IncompleteConversionOutput { diagnostics, .. }
            | Self::PointCloudMissing { diagnostics, .. }
            | Self::StereoTimeout { diagnostics, .. }
            | Self::RasterizationOutputMissing { diagnostics, .. }
            | Self::CoregistrationOutputMissing { diagnostics, .. }
            | Self::ToolFailed { diagnostics, .. }
            | Self::ConversionToolFailed { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }

    /// Returns true for errors caused by the tool running out of time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::ToolTimeout { .. } | Self::StereoTimeout { .. })
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.code()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        match self {
            Self::ToolTimeout { program, timeout, .. } => {
                map.insert("program".to_string(), serde_json::json!(program));
                map.insert(
                    "timeout_seconds".to_string(),
                    serde_json::json!(timeout.as_secs_f64()),
                );
            }
            Self::StereoTimeout { timeout, .. } => {
                map.insert(
                    "timeout_seconds".to_string(),
                    serde_json::json!(timeout.as_secs_f64()),
                );
            }
            Self::ToolLaunch { program, .. } => {
                map.insert("program".to_string(), serde_json::json!(program));
            }
            Self::ToolFailed { program, exit_code, .. } => {
                map.insert("program".to_string(), serde_json::json!(program));
                map.insert("exit_code".to_string(), serde_json::json!(exit_code));
            }
            Self::ConversionToolFailed { exit_code, .. } => {
                map.insert("exit_code".to_string(), serde_json::json!(exit_code));
            }
            Self::IncompleteConversionOutput { missing, .. } => {
                map.insert("missing".to_string(), serde_json::json!(missing));
            }
            Self::PointCloudMissing { expected, .. }
            | Self::RasterizationOutputMissing { expected, .. } => {
                map.insert(
                    "expected".to_string(),
                    serde_json::json!(expected.display().to_string()),
                );
            }
            _ => {}
        }

        if let Some(diagnostics) = self.diagnostics() {
            map.insert("diagnostics".to_string(), serde_json::json!(diagnostics));
        }

        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_taxonomy() {
        assert_eq!(DemflowError::NoValidTiles.code(), "NoValidTiles");
        assert_eq!(
            DemflowError::ToolLaunch {
                program: "stereo".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }
            .code(),
            "ToolLaunchError"
        );
        assert_eq!(
            DemflowError::StereoTimeout {
                timeout: Duration::from_secs(1),
                diagnostics: String::new(),
            }
            .code(),
            "StereoTimeout"
        );
    }

    #[test]
    fn test_diagnostics_are_kept_verbatim() {
        let err = DemflowError::ConversionToolFailed {
            exit_code: Some(2),
            diagnostics: "ERROR: missing Band3N\n".to_string(),
        };
        assert_eq!(err.diagnostics(), Some("ERROR: missing Band3N\n"));
        assert!(err.to_string().contains("exit code 2"));

        assert!(DemflowError::NoValidTiles.diagnostics().is_none());
    }

    #[test]
    fn test_signal_exit_display() {
        let err = DemflowError::ToolFailed {
            program: "point2dem".to_string(),
            exit_code: None,
            diagnostics: String::new(),
        };
        assert!(err.to_string().contains("terminated by signal"));
    }

    #[test]
    fn test_to_dict() {
        let err = DemflowError::IncompleteConversionOutput {
            missing: vec!["*Band3B.xml".to_string()],
            diagnostics: "done".to_string(),
        };
        let dict = err.to_dict();

        assert_eq!(dict.get("type").unwrap(), "IncompleteConversionOutput");
        assert_eq!(dict.get("missing").unwrap(), &serde_json::json!(["*Band3B.xml"]));
        assert_eq!(dict.get("diagnostics").unwrap(), "done");
    }

    #[test]
    fn test_is_timeout() {
        let err = DemflowError::ToolTimeout {
            program: "aster2asp".to_string(),
            timeout: Duration::from_secs(5),
            diagnostics: String::new(),
        };
        assert!(err.is_timeout());
        assert!(!DemflowError::NoValidTiles.is_timeout());
    }
}
