//! Multi-tile DEM mosaicking.
//!
//! Tiles must share CRS, pixel size, band count and pixel lattice. The
//! output covers the union footprint and keeps the highest valid elevation
//! wherever tiles overlap.

mod mosaic;

pub use mosaic::MaxAccumulator;

use crate::core::StageId;
use crate::errors::{DemflowError, Result};
use crate::raster::{geotiff, GeoTransform, Raster, RasterInfo, DEFAULT_NODATA};
use crate::stages::{Stage, StageArtifacts, StageContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Relative tolerance for pixel size and lattice comparisons.
const GRID_TOLERANCE: f64 = 1e-6;

/// Which rasters a multi-input job delivers and coregisters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Deliver each input's DEM; never merge.
    IndividualOnly,
    /// Deliver each input's DEM and the merged DEM.
    #[default]
    IndividualAndMerged,
    /// Deliver only the merged DEM.
    MergedOnly,
}

impl MergeMode {
    /// Returns true if the mode produces a merged raster.
    #[must_use]
    pub const fn merges(&self) -> bool {
        !matches!(self, Self::IndividualOnly)
    }

    /// Returns true if individual rasters are delivered.
    #[must_use]
    pub const fn delivers_individual(&self) -> bool {
        !matches!(self, Self::MergedOnly)
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndividualOnly => write!(f, "individual_only"),
            Self::IndividualAndMerged => write!(f, "individual_and_merged"),
            Self::MergedOnly => write!(f, "merged_only"),
        }
    }
}

/// Ordered input tiles and one output path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    /// Input tiles.
    pub inputs: Vec<PathBuf>,
    /// Where the mosaic is written.
    pub output: PathBuf,
}

impl MergeRequest {
    /// Creates a merge request.
    #[must_use]
    pub fn new(inputs: Vec<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            inputs,
            output: output.into(),
        }
    }
}

/// Result of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The written mosaic.
    pub output: PathBuf,
    /// Tiles that contributed.
    pub tiles: Vec<PathBuf>,
    /// Requested tiles that did not exist.
    pub skipped: Vec<PathBuf>,
    /// True if the single remaining tile was copied instead of merged.
    pub copied: bool,
}

impl StageArtifacts for MergeOutcome {
    fn primary(&self) -> &Path {
        &self.output
    }
}

/// Mosaics tiles with elevation-max compositing.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeEngine;

impl MergeEngine {
    /// Creates a merge engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Runs a merge synchronously.
    pub fn merge(&self, request: &MergeRequest) -> Result<MergeOutcome> {
        let (tiles, skipped): (Vec<PathBuf>, Vec<PathBuf>) =
            request.inputs.iter().cloned().partition(|p| p.is_file());
        for path in &skipped {
            warn!(tile = %path.display(), "Merge input missing, skipped");
        }

        match tiles.as_slice() {
            [] => Err(DemflowError::NoValidTiles),
            [only] => {
                std::fs::copy(only, &request.output)?;
                info!(tile = %only.display(), output = %request.output.display(), "Single tile copied");
                Ok(MergeOutcome {
                    output: request.output.clone(),
                    tiles,
                    skipped,
                    copied: true,
                })
            }
            _ => {
                mosaic_tiles(&tiles, &request.output)?;
                Ok(MergeOutcome {
                    output: request.output.clone(),
                    tiles,
                    skipped,
                    copied: false,
                })
            }
        }
    }
}

#[async_trait]
impl Stage for MergeEngine {
    type Input = MergeRequest;
    type Output = MergeOutcome;

    fn id(&self) -> StageId {
        StageId::Merge
    }

    async fn run(&self, _ctx: &StageContext, request: MergeRequest) -> Result<MergeOutcome> {
        let engine = *self;
        tokio::task::spawn_blocking(move || engine.merge(&request))
            .await
            .map_err(|e| DemflowError::Io(std::io::Error::other(e)))?
    }
}

/// Output grid derived from the first tile and the union footprint.
struct MosaicGrid {
    transform: GeoTransform,
    width: usize,
    height: usize,
}

impl MosaicGrid {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn offset_of(&self, tile: &RasterInfo) -> (usize, usize) {
        let (col, row) = self
            .transform
            .world_to_pixel(tile.transform.origin_x, tile.transform.origin_y);
        (row.round().max(0.0) as usize, col.round().max(0.0) as usize)
    }
}

fn mosaic_tiles(tiles: &[PathBuf], output: &Path) -> Result<()> {
    // Metadata pass: validate geometry before decoding any pixels.
    let infos = tiles
        .iter()
        .map(|path| geotiff::read_info(path))
        .collect::<Result<Vec<_>>>()?;
    let first = &infos[0];
    for (path, info) in tiles.iter().zip(&infos) {
        check_compatible(first, info, path)?;
    }

    let grid = union_grid(&infos);
    let nodata = first.nodata.unwrap_or(DEFAULT_NODATA);
    debug!(
        width = grid.width,
        height = grid.height,
        tiles = tiles.len(),
        "Mosaic grid computed"
    );

    let mut acc = MaxAccumulator::new(first.bands, grid.height, grid.width);
    for (path, info) in tiles.iter().zip(&infos) {
        // Each tile is read, folded in and dropped before the next is opened.
        let raster = geotiff::read(path)?;
        let (row, col) = grid.offset_of(info);
        acc.add(raster.data.view(), raster.nodata, row, col);
    }

    let covered = acc.covered_pixels();
    #[allow(clippy::cast_possible_truncation)]
    let merged = Raster {
        data: acc.finish(nodata as f32),
        transform: grid.transform,
        crs: first.crs.clone(),
        nodata: Some(nodata),
    };
    geotiff::write(output, &merged)?;

    info!(
        output = %output.display(),
        tiles = tiles.len(),
        width = grid.width,
        height = grid.height,
        covered_pixels = covered,
        "Tiles merged"
    );
    Ok(())
}

fn check_compatible(first: &RasterInfo, tile: &RasterInfo, path: &Path) -> Result<()> {
    if tile.crs != first.crs {
        return Err(DemflowError::incompatible_tile(
            path,
            format!("CRS {:?} differs from {:?}", tile.crs, first.crs),
        ));
    }
    if tile.bands != first.bands {
        return Err(DemflowError::incompatible_tile(
            path,
            format!("{} bands, expected {}", tile.bands, first.bands),
        ));
    }
    let (ft, tt) = (first.transform, tile.transform);
    if tt.pixel_height >= 0.0 || tt.pixel_width <= 0.0 {
        return Err(DemflowError::incompatible_tile(path, "raster is not north-up"));
    }
    if !close(tt.pixel_width, ft.pixel_width) || !close(tt.pixel_height, ft.pixel_height) {
        return Err(DemflowError::incompatible_tile(
            path,
            format!(
                "pixel size {}x{} differs from {}x{}",
                tt.pixel_width, tt.pixel_height, ft.pixel_width, ft.pixel_height
            ),
        ));
    }
    let (col, row) = ft.world_to_pixel(tt.origin_x, tt.origin_y);
    if (col - col.round()).abs() > GRID_TOLERANCE || (row - row.round()).abs() > GRID_TOLERANCE {
        return Err(DemflowError::incompatible_tile(
            path,
            format!("origin is off the shared pixel lattice by ({col:.4}, {row:.4}) pixels"),
        ));
    }
    Ok(())
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= GRID_TOLERANCE * a.abs().max(b.abs())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn union_grid(infos: &[RasterInfo]) -> MosaicGrid {
    let first = infos[0].transform;
    let bounds = infos
        .iter()
        .map(RasterInfo::bounds)
        .reduce(|a, b| a.union(&b))
        .unwrap_or_else(|| infos[0].bounds());
    let pixel = first.pixel_width;
    let pixel_y = first.pixel_height.abs();

    MosaicGrid {
        transform: GeoTransform {
            origin_x: bounds.min_x,
            origin_y: bounds.max_y,
            pixel_width: pixel,
            pixel_height: first.pixel_height,
        },
        width: (bounds.width() / pixel).round() as usize,
        height: (bounds.height() / pixel_y).round() as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_dem, write_flat_dem};

    #[test]
    fn test_three_flat_tiles_merge_to_max() {
        let dir = tempfile::tempdir().unwrap();
        let tiles: Vec<PathBuf> = [100.0, 150.0, 200.0]
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let path = dir.path().join(format!("tile_{i}.tif"));
                write_flat_dem(&path, 8, 6, v).unwrap();
                path
            })
            .collect();
        let output = dir.path().join("merged.tif");

        let outcome = MergeEngine::new()
            .merge(&MergeRequest::new(tiles, &output))
            .unwrap();

        assert!(!outcome.copied);
        let merged = geotiff::read(&output).unwrap();
        assert_eq!(merged.data.dim(), (1, 6, 8));
        assert!(merged.data.iter().all(|&v| v == 200.0));
    }

    #[test]
    fn test_single_tile_is_byte_copy() {
        let dir = tempfile::tempdir().unwrap();
        let tile = dir.path().join("only.tif");
        write_flat_dem(&tile, 4, 4, 321.0).unwrap();
        let output = dir.path().join("merged.tif");

        let outcome = MergeEngine::new()
            .merge(&MergeRequest::new(
                vec![dir.path().join("missing.tif"), tile.clone()],
                &output,
            ))
            .unwrap();

        assert!(outcome.copied);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(std::fs::read(&tile).unwrap(), std::fs::read(&output).unwrap());
    }

    #[test]
    fn test_no_existing_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let err = MergeEngine::new()
            .merge(&MergeRequest::new(
                vec![dir.path().join("a.tif")],
                dir.path().join("out.tif"),
            ))
            .unwrap_err();
        assert_eq!(err.code(), "NoValidTiles");
    }

    #[test]
    fn test_overlapping_tiles_cover_union() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.tif");
        let b = dir.path().join("b.tif");
        // b is shifted two pixels east and one pixel south of a.
        write_dem(&a, &Raster::filled(4, 4, 10.0, GeoTransform::north_up(0.0, 120.0, 30.0), Some("EPSG:32643".into()))).unwrap();
        write_dem(&b, &Raster::filled(4, 4, 20.0, GeoTransform::north_up(60.0, 90.0, 30.0), Some("EPSG:32643".into()))).unwrap();
        let output = dir.path().join("merged.tif");

        MergeEngine::new()
            .merge(&MergeRequest::new(vec![a, b], &output))
            .unwrap();

        let merged = geotiff::read(&output).unwrap();
        assert_eq!(merged.data.dim(), (1, 5, 6));
        assert_eq!(merged.transform.origin_x, 0.0);
        assert_eq!(merged.transform.origin_y, 120.0);
        assert_eq!(merged.data[[0, 0, 0]], 10.0);
        assert_eq!(merged.data[[0, 2, 3]], 20.0);
        assert_eq!(merged.data[[0, 4, 5]], 20.0);
        assert_eq!(merged.data[[0, 4, 0]], -9999.0);
        assert_eq!(merged.data[[0, 0, 5]], -9999.0);
    }

    #[test]
    fn test_input_order_does_not_change_output() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.tif");
        let b = dir.path().join("b.tif");
        let mut ra = Raster::filled(3, 3, 50.0, GeoTransform::north_up(0.0, 90.0, 30.0), Some("EPSG:32643".into()));
        ra.data[[0, 1, 1]] = 500.0;
        write_dem(&a, &ra).unwrap();
        write_dem(&b, &Raster::filled(3, 3, 60.0, GeoTransform::north_up(30.0, 90.0, 30.0), Some("EPSG:32643".into()))).unwrap();

        let ab = dir.path().join("ab.tif");
        let ba = dir.path().join("ba.tif");
        MergeEngine::new().merge(&MergeRequest::new(vec![a.clone(), b.clone()], &ab)).unwrap();
        MergeEngine::new().merge(&MergeRequest::new(vec![b, a], &ba)).unwrap();

        let ab = geotiff::read(&ab).unwrap();
        let ba = geotiff::read(&ba).unwrap();
        assert_eq!(ab.data, ba.data);
        assert_eq!(ab.transform, ba.transform);
        assert_eq!(ab.data[[0, 1, 1]], 500.0);
    }

    #[test]
    fn test_incompatible_crs_and_lattice() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.tif");
        let b = dir.path().join("b.tif");
        let c = dir.path().join("c.tif");
        write_dem(&a, &Raster::filled(2, 2, 1.0, GeoTransform::north_up(0.0, 60.0, 30.0), Some("EPSG:32643".into()))).unwrap();
        write_dem(&b, &Raster::filled(2, 2, 1.0, GeoTransform::north_up(0.0, 60.0, 30.0), Some("EPSG:32644".into()))).unwrap();
        write_dem(&c, &Raster::filled(2, 2, 1.0, GeoTransform::north_up(15.0, 60.0, 30.0), Some("EPSG:32643".into()))).unwrap();
        let out = dir.path().join("out.tif");

        let err = MergeEngine::new()
            .merge(&MergeRequest::new(vec![a.clone(), b], &out))
            .unwrap_err();
        assert_eq!(err.code(), "IncompatibleTileGeometry");

        let err = MergeEngine::new()
            .merge(&MergeRequest::new(vec![a, c], &out))
            .unwrap_err();
        assert!(err.to_string().contains("lattice"));
    }

    #[test]
    fn test_pixel_size_mismatch_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.tif");
        let b = dir.path().join("b.tif");
        write_dem(&a, &Raster::filled(4, 4, 1.0, GeoTransform::north_up(0.0, 120.0, 30.0), Some("EPSG:32643".into()))).unwrap();
        write_dem(&b, &Raster::filled(4, 4, 1.0, GeoTransform::north_up(0.0, 120.0, 10.0), Some("EPSG:32643".into()))).unwrap();
        let out = dir.path().join("out.tif");

        let err = MergeEngine::new()
            .merge(&MergeRequest::new(vec![a, b], &out))
            .unwrap_err();

        assert_eq!(err.code(), "IncompatibleTileGeometry");
        assert!(err.to_string().contains("pixel size"));
        assert!(!out.exists());
    }

    #[test]
    fn test_south_up_tile_is_incompatible() {
        let info = |transform| RasterInfo {
            width: 4,
            height: 4,
            bands: 1,
            transform,
            crs: Some("EPSG:32643".to_string()),
            nodata: Some(-9999.0),
        };
        let first = info(GeoTransform::north_up(0.0, 120.0, 30.0));
        let flipped = info(GeoTransform {
            pixel_height: 30.0,
            ..GeoTransform::north_up(0.0, 0.0, 30.0)
        });

        let err = check_compatible(&first, &flipped, Path::new("flipped.tif")).unwrap_err();

        assert_eq!(err.code(), "IncompatibleTileGeometry");
        assert!(err.to_string().contains("not north-up"));
        assert!(check_compatible(&first, &first, Path::new("same.tif")).is_ok());
    }

    #[test]
    fn test_merge_mode_flags() {
        assert!(!MergeMode::IndividualOnly.merges());
        assert!(MergeMode::IndividualAndMerged.merges());
        assert!(MergeMode::IndividualAndMerged.delivers_individual());
        assert!(!MergeMode::MergedOnly.delivers_individual());
        assert_eq!(
            serde_json::to_string(&MergeMode::MergedOnly).unwrap(),
            "\"merged_only\""
        );
    }
}
