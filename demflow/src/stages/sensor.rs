//! Sensor-specific naming of stereo products.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The imaging sensor an input comes from.
///
/// The profile fixes the correlation session and the names of the
/// conversion products; neither is user-selectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorProfile {
    /// Terra ASTER L1A, nadir band 3N and backward band 3B.
    #[default]
    Aster,
}

impl SensorProfile {
    /// Session name passed to the correlation tool.
    #[must_use]
    pub const fn session(&self) -> &'static str {
        match self {
            Self::Aster => "aster",
        }
    }

    /// Patterns of the left image, right image, left camera and right camera.
    #[must_use]
    pub const fn required_products(&self) -> [&'static str; 4] {
        match self {
            Self::Aster => ["*Band3N.tif", "*Band3B.tif", "*Band3N.xml", "*Band3B.xml"],
        }
    }
}

impl fmt::Display for SensorProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.session())
    }
}
