//! Handle on a produced raster with lazily computed statistics.

use super::{geotiff, BandStatistics, Bounds, RasterInfo};
use crate::errors::Result;
use ndarray::Axis;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// A raster on disk whose metadata has been read.
///
/// Pixel statistics are computed on first request and cached for the
/// lifetime of the handle.
#[derive(Debug)]
pub struct RasterArtifact {
    path: PathBuf,
    info: RasterInfo,
    statistics: OnceLock<Vec<BandStatistics>>,
}

impl RasterArtifact {
    /// Opens a raster and reads its metadata.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let info = geotiff::read_info(&path)?;
        Ok(Self {
            path,
            info,
            statistics: OnceLock::new(),
        })
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the raster metadata.
    #[must_use]
    pub fn info(&self) -> &RasterInfo {
        &self.info
    }

    /// Returns the spatial bounds.
    #[must_use]
    pub fn bounds(&self) -> Bounds {
        self.info.bounds()
    }

    /// Returns the CRS identifier, if declared.
    #[must_use]
    pub fn crs(&self) -> Option<&str> {
        self.info.crs.as_deref()
    }

    /// Returns `(width, height)` in pixels.
    #[must_use]
    pub fn dimensions(&self) -> (usize, usize) {
        (self.info.width, self.info.height)
    }

    /// Returns the number of bands.
    #[must_use]
    pub fn band_count(&self) -> usize {
        self.info.bands
    }

    /// Returns the nodata sentinel, if declared.
    #[must_use]
    pub fn nodata(&self) -> Option<f64> {
        self.info.nodata
    }

    /// Returns per-band statistics, decoding pixels on the first call.
    pub fn statistics(&self) -> Result<&[BandStatistics]> {
        if let Some(cached) = self.statistics.get() {
            return Ok(cached);
        }
        let raster = geotiff::read(&self.path)?;
        let computed = raster
            .data
            .axis_iter(Axis(0))
            .map(|band| BandStatistics::compute(band, raster.nodata))
            .collect();
        Ok(self.statistics.get_or_init(|| computed))
    }
}
