//! Output projection selection.
//!
//! `Auto` picks the WGS84 UTM zone containing the scene centre, including the
//! Norway and Svalbard zone exceptions.

use crate::errors::{DemflowError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// EPSG code of geographic WGS84.
pub const WGS84_GEOGRAPHIC: u32 = 4326;

/// A longitude/latitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Longitude in degrees, east positive.
    pub lon: f64,
    /// Latitude in degrees, north positive.
    pub lat: f64,
}

impl GeoPoint {
    /// Creates a new point.
    #[must_use]
    pub const fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Returns true if both coordinates are within their valid ranges.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.lon.is_finite()
            && self.lat.is_finite()
            && (-180.0..=180.0).contains(&self.lon)
            && (-90.0..=90.0).contains(&self.lat)
    }
}

/// The user's choice of output projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionChoice {
    /// UTM zone of the scene centre.
    #[default]
    Auto,
    /// Geographic WGS84 (EPSG:4326).
    Geographic,
    /// An explicit EPSG code.
    Epsg(u32),
}

impl ProjectionChoice {
    /// Resolves the choice to an `EPSG:<code>` identifier.
    ///
    /// `Auto` requires a valid scene location; there is no fallback zone.
    pub fn resolve(&self, scene: Option<GeoPoint>) -> Result<String> {
        let code = match self {
            Self::Auto => {
                let point = scene.ok_or_else(|| DemflowError::ProjectionUnresolved {
                    reason: "scene location is unknown".to_string(),
                })?;
                if !point.is_valid() {
                    return Err(DemflowError::ProjectionUnresolved {
                        reason: format!("scene location {}, {} is out of range", point.lon, point.lat),
                    });
                }
                utm_epsg(point)
            }
            Self::Geographic => WGS84_GEOGRAPHIC,
            Self::Epsg(code) => *code,
        };
        Ok(format!("EPSG:{code}"))
    }
}

impl fmt::Display for ProjectionChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Geographic => write!(f, "EPSG:{WGS84_GEOGRAPHIC}"),
            Self::Epsg(code) => write!(f, "EPSG:{code}"),
        }
    }
}

impl FromStr for ProjectionChoice {
    type Err = DemflowError;

    /// Accepts `auto`, `geographic`, `EPSG:<code>` or a bare code.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        if s.eq_ignore_ascii_case("geographic") {
            return Ok(Self::Geographic);
        }
        let digits = s
            .split_once(':')
            .filter(|(authority, _)| authority.eq_ignore_ascii_case("epsg"))
            .map_or(s, |(_, code)| code);
        let code: u32 = digits
            .parse()
            .map_err(|_| DemflowError::config(format!("invalid projection '{s}'")))?;
        if code == 0 {
            return Err(DemflowError::config("EPSG code must be positive"));
        }
        Ok(if code == WGS84_GEOGRAPHIC {
            Self::Geographic
        } else {
            Self::Epsg(code)
        })
    }
}

/// Returns the UTM zone number (1-60) for a location.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn utm_zone(point: GeoPoint) -> u32 {
    let GeoPoint { lon, lat } = point;

    if (56.0..64.0).contains(&lat) && (3.0..12.0).contains(&lon) {
        return 32;
    }
    if (72.0..84.0).contains(&lat) && (0.0..42.0).contains(&lon) {
        return match lon {
            l if l < 9.0 => 31,
            l if l < 21.0 => 33,
            l if l < 33.0 => 35,
            _ => 37,
        };
    }

    let zone = ((lon + 180.0) / 6.0).floor() as i64 + 1;
    zone.clamp(1, 60) as u32
}

/// Returns the EPSG code of the WGS84 UTM zone for a location.
#[must_use]
pub fn utm_epsg(point: GeoPoint) -> u32 {
    let base = if point.lat >= 0.0 { 32600 } else { 32700 };
    base + utm_zone(point)
}
