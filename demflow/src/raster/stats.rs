//! Per-band summary statistics over valid pixels.

use super::is_valid;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// Summary statistics of one raster band.
///
/// Only valid pixels contribute. A band without any valid pixel reports
/// zeros everywhere instead of undefined values.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BandStatistics {
    /// Minimum valid value.
    pub min: f64,
    /// Maximum valid value.
    pub max: f64,
    /// Mean of valid values.
    pub mean: f64,
    /// Population standard deviation of valid values.
    pub std: f64,
    /// Number of valid pixels.
    pub valid_pixels: u64,
    /// Total number of pixels.
    pub total_pixels: u64,
}

impl BandStatistics {
    /// Computes statistics for a band.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(band: ArrayView2<'_, f32>, nodata: Option<f64>) -> Self {
        let mut count = 0u64;
        let mut mean = 0.0f64;
        let mut m2 = 0.0f64;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        // Welford's online update keeps the variance stable on large rasters.
        for &value in band.iter().filter(|&&v| is_valid(v, nodata)) {
            let v = f64::from(value);
            count += 1;
            let delta = v - mean;
            mean += delta / count as f64;
            m2 += delta * (v - mean);
            min = min.min(v);
            max = max.max(v);
        }

        let total_pixels = band.len() as u64;
        if count == 0 {
            return Self {
                total_pixels,
                ..Self::default()
            };
        }

        Self {
            min,
            max,
            mean,
            std: (m2 / count as f64).sqrt(),
            valid_pixels: count,
            total_pixels,
        }
    }

    /// Fraction of pixels that hold data.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn coverage(&self) -> f64 {
        if self.total_pixels == 0 {
            return 0.0;
        }
        self.valid_pixels as f64 / self.total_pixels as f64
    }
}
