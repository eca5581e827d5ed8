//! GeoTIFF reading and writing on top of the `tiff` crate.
//!
//! Only the georeferencing subset the pipeline needs is handled: pixel scale
//! with a tiepoint (or a rotation-free model transformation), the EPSG code
//! from the GeoKey directory, and the GDAL nodata tag.

use super::{GeoTransform, Raster, RasterInfo};
use crate::errors::{DemflowError, Result};
use ndarray::{Array3, Axis};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

const KEY_MODEL_TYPE: u16 = 1024;
const KEY_RASTER_TYPE: u16 = 1025;
const KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const KEY_PROJECTED_CS_TYPE: u16 = 3072;
const USER_DEFINED: u16 = 32767;

const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// Reads size, georeferencing and nodata without decoding pixels.
pub fn read_info(path: &Path) -> Result<RasterInfo> {
    let mut decoder = open(path)?;
    read_info_from(&mut decoder, path)
}

/// Reads a whole raster into memory as `f32` samples.
pub fn read(path: &Path) -> Result<Raster> {
    let mut decoder = open(path)?;
    let info = read_info_from(&mut decoder, path)?;

    let samples = decoder
        .read_image()
        .map_err(|e| DemflowError::raster(path, e))
        .and_then(|result| to_f32(result, path))?;

    let expected = info.width * info.height * info.bands;
    if samples.len() != expected {
        return Err(DemflowError::raster(
            path,
            format!("expected {expected} samples, decoded {}", samples.len()),
        ));
    }

    // Chunky layout: samples of one pixel are adjacent.
    let (bands, width) = (info.bands, info.width);
    let data = Array3::from_shape_fn((bands, info.height, width), |(b, row, col)| {
        samples[(row * width + col) * bands + b]
    });

    Ok(Raster {
        data,
        transform: info.transform,
        crs: info.crs,
        nodata: info.nodata,
    })
}

/// Writes a single-band `f32` GeoTIFF.
pub fn write(path: &Path, raster: &Raster) -> Result<()> {
    if raster.band_count() != 1 {
        return Err(DemflowError::raster(
            path,
            format!("only single-band output is supported, got {} bands", raster.band_count()),
        ));
    }
    let width = u32::try_from(raster.width())
        .map_err(|_| DemflowError::raster(path, "width exceeds TIFF limits"))?;
    let height = u32::try_from(raster.height())
        .map_err(|_| DemflowError::raster(path, "height exceeds TIFF limits"))?;

    let file = File::create(path)?;
    let mut encoder =
        TiffEncoder::new(BufWriter::new(file)).map_err(|e| DemflowError::raster(path, e))?;
    let mut image = encoder
        .new_image::<colortype::Gray32Float>(width, height)
        .map_err(|e| DemflowError::raster(path, e))?;

    let t = raster.transform;
    let scale = [t.pixel_width, t.pixel_height.abs(), 0.0];
    let tiepoint = [0.0, 0.0, 0.0, t.origin_x, t.origin_y, 0.0];
    let geokeys = geokey_directory(raster.crs.as_deref());

    {
        let dir = image.encoder();
        dir.write_tag(Tag::ModelPixelScaleTag, &scale[..])
            .map_err(|e| DemflowError::raster(path, e))?;
        dir.write_tag(Tag::ModelTiepointTag, &tiepoint[..])
            .map_err(|e| DemflowError::raster(path, e))?;
        dir.write_tag(Tag::GeoKeyDirectoryTag, &geokeys[..])
            .map_err(|e| DemflowError::raster(path, e))?;
        if let Some(nodata) = raster.nodata {
            dir.write_tag(Tag::GdalNodata, nodata.to_string().as_str())
                .map_err(|e| DemflowError::raster(path, e))?;
        }
    }

    let samples: Vec<f32> = raster.data.index_axis(Axis(0), 0).iter().copied().collect();
    image
        .write_data(&samples)
        .map_err(|e| DemflowError::raster(path, e))
}

fn open(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path).map_err(|e| DemflowError::raster(path, e))?;
    Decoder::new(BufReader::new(file))
        .map(|decoder| decoder.with_limits(Limits::unlimited()))
        .map_err(|e| DemflowError::raster(path, e))
}

fn read_info_from<R: Read + Seek>(decoder: &mut Decoder<R>, path: &Path) -> Result<RasterInfo> {
    let raster_err = |e: tiff::TiffError| DemflowError::raster(path, e);

    let (width, height) = decoder.dimensions().map_err(raster_err)?;
    let bands = decoder
        .find_tag(Tag::SamplesPerPixel)
        .map_err(raster_err)?
        .map(tiff::decoder::ifd::Value::into_u32)
        .transpose()
        .map_err(raster_err)?
        .unwrap_or(1);

    let scale = find_f64_vec(decoder, Tag::ModelPixelScaleTag, path)?;
    let tiepoint = find_f64_vec(decoder, Tag::ModelTiepointTag, path)?;
    let transform = match (scale, tiepoint) {
        (Some(scale), Some(tiepoint)) => GeoTransform::from_tiepoint(&tiepoint, &scale),
        _ => find_f64_vec(decoder, Tag::ModelTransformationTag, path)?
            .and_then(|matrix| GeoTransform::from_model_transformation(&matrix)),
    }
    .ok_or_else(|| DemflowError::raster(path, "raster is not georeferenced"))?;

    let crs = decoder
        .find_tag(Tag::GeoKeyDirectoryTag)
        .map_err(raster_err)?
        .map(tiff::decoder::ifd::Value::into_u32_vec)
        .transpose()
        .map_err(raster_err)?
        .and_then(|keys| crs_from_geokeys(&keys));

    let nodata = decoder
        .find_tag(Tag::GdalNodata)
        .map_err(raster_err)?
        .map(tiff::decoder::ifd::Value::into_string)
        .transpose()
        .map_err(raster_err)?
        .and_then(|text| parse_nodata(&text));

    Ok(RasterInfo {
        width: width as usize,
        height: height as usize,
        bands: bands as usize,
        transform,
        crs,
        nodata,
    })
}

fn find_f64_vec<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    tag: Tag,
    path: &Path,
) -> Result<Option<Vec<f64>>> {
    decoder
        .find_tag(tag)
        .map_err(|e| DemflowError::raster(path, e))?
        .map(tiff::decoder::ifd::Value::into_f64_vec)
        .transpose()
        .map_err(|e| DemflowError::raster(path, e))
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn to_f32(result: DecodingResult, path: &Path) -> Result<Vec<f32>> {
    let samples = match result {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
        #[allow(unreachable_patterns)]
        _ => return Err(DemflowError::raster(path, "unsupported sample format")),
    };
    Ok(samples)
}

/// Extracts `EPSG:<code>` from a GeoKey directory.
///
/// Only keys stored inline (TIFF tag location 0) are read.
fn crs_from_geokeys(keys: &[u32]) -> Option<String> {
    if keys.len() < 4 {
        return None;
    }
    let count = keys[3] as usize;
    let lookup = |wanted: u16| {
        keys[4..]
            .chunks_exact(4)
            .take(count)
            .find(|entry| entry[0] == u32::from(wanted) && entry[1] == 0)
            .map(|entry| entry[3])
            .filter(|&code| code != 0 && code != u32::from(USER_DEFINED))
    };
    lookup(KEY_PROJECTED_CS_TYPE)
        .or_else(|| lookup(KEY_GEOGRAPHIC_TYPE))
        .map(|code| format!("EPSG:{code}"))
}

/// Builds the GeoKey directory for an `EPSG:<code>` identifier.
fn geokey_directory(crs: Option<&str>) -> Vec<u16> {
    let Some(code) = crs.and_then(epsg_code) else {
        return vec![1, 1, 0, 1, KEY_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA];
    };
    let geographic = (4000..5000).contains(&code);
    let (model_type, cs_key) = if geographic {
        (MODEL_TYPE_GEOGRAPHIC, KEY_GEOGRAPHIC_TYPE)
    } else {
        (MODEL_TYPE_PROJECTED, KEY_PROJECTED_CS_TYPE)
    };
    #[rustfmt::skip]
    let keys = vec![
        1, 1, 0, 3,
        KEY_MODEL_TYPE, 0, 1, model_type,
        KEY_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA,
        cs_key, 0, 1, code,
    ];
    keys
}

/// Parses the numeric part of an `EPSG:<code>` identifier.
#[must_use]
pub fn epsg_code(crs: &str) -> Option<u16> {
    let (authority, code) = crs.split_once(':')?;
    if !authority.eq_ignore_ascii_case("epsg") {
        return None;
    }
    code.trim().parse().ok()
}

fn parse_nodata(text: &str) -> Option<f64> {
    text.trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .parse()
        .ok()
}
