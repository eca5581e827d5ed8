//! Geospatial raster model and GeoTIFF I/O.
//!
//! Coordinate order convention:
//!
//! - Bounds are `[min_x, min_y, max_x, max_y]` = `[west, south, east, north]`
//!   in the raster's own CRS.
//! - Pixel `(row, col)` = `(0, 0)` is the north-west corner of the raster.

mod artifact;
pub mod geotiff;
mod stats;

pub use artifact::RasterArtifact;
pub use stats::BandStatistics;

use ndarray::Array3;
use serde::{Deserialize, Serialize};

/// Default nodata sentinel written by the raster generation tool.
pub const DEFAULT_NODATA: f64 = -9999.0;

/// Axis-aligned bounds in a raster's CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// West edge.
    pub min_x: f64,
    /// South edge.
    pub min_y: f64,
    /// East edge.
    pub max_x: f64,
    /// North edge.
    pub max_y: f64,
}

impl Bounds {
    /// Returns the smallest bounds containing both.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Width in CRS units.
    #[must_use]
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Height in CRS units.
    #[must_use]
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// North-up affine transform without rotation terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    /// X coordinate of the upper-left corner.
    pub origin_x: f64,
    /// Y coordinate of the upper-left corner.
    pub origin_y: f64,
    /// Pixel width (positive).
    pub pixel_width: f64,
    /// Pixel height (negative for north-up rasters).
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Creates a north-up transform from its upper-left corner and resolution.
    #[must_use]
    pub fn north_up(origin_x: f64, origin_y: f64, resolution: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width: resolution,
            pixel_height: -resolution,
        }
    }

    /// Builds a transform from GeoTIFF `ModelTiepoint` and `ModelPixelScale`.
    ///
    /// The tiepoint maps raster point `(i, j)` to model point `(x, y)`.
    #[must_use]
    pub fn from_tiepoint(tiepoint: &[f64], scale: &[f64]) -> Option<Self> {
        if tiepoint.len() < 6 || scale.len() < 2 {
            return None;
        }
        let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
        let (sx, sy) = (scale[0], scale[1]);
        Some(Self {
            origin_x: x - i * sx,
            origin_y: y + j * sy,
            pixel_width: sx,
            pixel_height: -sy,
        })
    }

    /// Builds a transform from the 16-element `ModelTransformation` matrix.
    ///
    /// Rotation terms are rejected.
    #[must_use]
    pub fn from_model_transformation(matrix: &[f64]) -> Option<Self> {
        if matrix.len() < 8 || matrix[1] != 0.0 || matrix[4] != 0.0 {
            return None;
        }
        Some(Self {
            origin_x: matrix[3],
            origin_y: matrix[7],
            pixel_width: matrix[0],
            pixel_height: matrix[5],
        })
    }

    /// Convert pixel coordinates to world coordinates.
    #[inline]
    #[must_use]
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width,
            self.origin_y + row * self.pixel_height,
        )
    }

    /// Convert world coordinates to (fractional) pixel coordinates.
    #[inline]
    #[must_use]
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (y - self.origin_y) / self.pixel_height,
        )
    }

    /// Bounds covered by a `width` × `height` raster on this transform.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn bounds(&self, width: usize, height: usize) -> Bounds {
        let (x0, y0) = self.pixel_to_world(0.0, 0.0);
        let (x1, y1) = self.pixel_to_world(width as f64, height as f64);
        Bounds {
            min_x: x0.min(x1),
            min_y: y0.min(y1),
            max_x: x0.max(x1),
            max_y: y0.max(y1),
        }
    }
}

/// Raster metadata that can be read without decoding pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterInfo {
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// Number of bands.
    pub bands: usize,
    /// Pixel-to-world transform.
    pub transform: GeoTransform,
    /// CRS identifier such as `EPSG:32643`, when declared.
    pub crs: Option<String>,
    /// Nodata sentinel, when declared.
    pub nodata: Option<f64>,
}

impl RasterInfo {
    /// Returns the spatial bounds.
    #[must_use]
    pub fn bounds(&self) -> Bounds {
        self.transform.bounds(self.width, self.height)
    }
}

/// A raster held in memory as `(band, row, col)` samples.
#[derive(Debug, Clone)]
pub struct Raster {
    /// Pixel samples, shape `(bands, height, width)`.
    pub data: Array3<f32>,
    /// Pixel-to-world transform.
    pub transform: GeoTransform,
    /// CRS identifier.
    pub crs: Option<String>,
    /// Nodata sentinel.
    pub nodata: Option<f64>,
}

impl Raster {
    /// Creates a single-band raster filled with `value`.
    #[must_use]
    pub fn filled(
        width: usize,
        height: usize,
        value: f32,
        transform: GeoTransform,
        crs: Option<String>,
    ) -> Self {
        Self {
            data: Array3::from_elem((1, height, width), value),
            transform,
            crs,
            nodata: Some(DEFAULT_NODATA),
        }
    }

    /// Number of bands.
    #[must_use]
    pub fn band_count(&self) -> usize {
        self.data.dim().0
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    /// Returns the metadata view of this raster.
    #[must_use]
    pub fn info(&self) -> RasterInfo {
        RasterInfo {
            width: self.width(),
            height: self.height(),
            bands: self.band_count(),
            transform: self.transform,
            crs: self.crs.clone(),
            nodata: self.nodata,
        }
    }

    /// Returns the spatial bounds.
    #[must_use]
    pub fn bounds(&self) -> Bounds {
        self.transform.bounds(self.width(), self.height())
    }
}

/// Returns true if `value` is a real measurement under `nodata`.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
pub fn is_valid(value: f32, nodata: Option<f64>) -> bool {
    if value.is_nan() {
        return false;
    }
    nodata.map_or(true, |nd| value != nd as f32)
}
