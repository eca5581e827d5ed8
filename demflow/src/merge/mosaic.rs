//! Max compositing accumulator.

use crate::raster::is_valid;
use ndarray::{s, Array3, ArrayView3, Zip};

/// Accumulates tiles placed on a common output grid, keeping the maximum
/// valid value per pixel.
///
/// The result does not depend on the order tiles are added in.
#[derive(Debug, Clone)]
pub struct MaxAccumulator {
    /// Running maximum per pixel: (bands, height, width).
    values: Array3<f32>,
    /// Number of valid contributions per pixel.
    count: Array3<u32>,
}

impl MaxAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new(bands: usize, height: usize, width: usize) -> Self {
        Self {
            values: Array3::from_elem((bands, height, width), f32::NEG_INFINITY),
            count: Array3::zeros((bands, height, width)),
        }
    }

    /// Returns `(bands, height, width)`.
    #[must_use]
    pub fn dim(&self) -> (usize, usize, usize) {
        self.values.dim()
    }

    /// Adds a tile whose upper-left pixel lands at `(row_offset, col_offset)`.
    ///
    /// The part of the tile outside the grid is ignored.
    pub fn add(&mut self, tile: ArrayView3<'_, f32>, nodata: Option<f64>, row_offset: usize, col_offset: usize) {
        let (bands, height, width) = self.values.dim();
        let (tile_bands, tile_height, tile_width) = tile.dim();
        if row_offset >= height || col_offset >= width {
            return;
        }
        let b = bands.min(tile_bands);
        let h = tile_height.min(height - row_offset);
        let w = tile_width.min(width - col_offset);

        let (rows, cols) = (row_offset..row_offset + h, col_offset..col_offset + w);
        Zip::from(self.values.slice_mut(s![..b, rows.clone(), cols.clone()]))
            .and(self.count.slice_mut(s![..b, rows, cols]))
            .and(tile.slice(s![..b, ..h, ..w]))
            .for_each(|acc, count, &value| {
                if is_valid(value, nodata) {
                    *acc = acc.max(value);
                    *count += 1;
                }
            });
    }

    /// Number of pixels with at least one valid contribution.
    #[must_use]
    pub fn covered_pixels(&self) -> usize {
        self.count.iter().filter(|&&c| c > 0).count()
    }

    /// Returns the composite, with `nodata` where nothing contributed.
    #[must_use]
    pub fn finish(self, nodata: f32) -> Array3<f32> {
        let mut values = self.values;
        Zip::from(&mut values).and(&self.count).for_each(|v, &c| {
            if c == 0 {
                *v = nodata;
            }
        });
        values
    }
}
