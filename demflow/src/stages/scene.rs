//! Scene centre lookup for automatic projection.
//!
//! ASTER L1A archives ship per-band lattice files (`*.Longitude.txt`,
//! `*.Latitude.txt`) with geodetic coordinates of a grid of image points. The
//! camera XML written by the conversion tool holds the same lattice in its
//! `LONGITUDE_LATITUDE_HEIGHT` block. Either one is enough to find the UTM zone.

use crate::crs::GeoPoint;
use crate::utils::FilePattern;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

#[allow(clippy::unwrap_used)]
static LLH_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<LONGITUDE_LATITUDE_HEIGHT>(.*?)</LONGITUDE_LATITUDE_HEIGHT>").unwrap()
});

#[allow(clippy::unwrap_used)]
static XML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Returns the scene centre from lattice files, then the camera XML.
#[must_use]
pub fn locate_scene(source_dir: &Path, camera_xml: Option<&Path>) -> Option<GeoPoint> {
    from_lattice_files(source_dir).or_else(|| camera_xml.and_then(from_camera_xml))
}

fn from_lattice_files(dir: &Path) -> Option<GeoPoint> {
    let find = |pattern: &str| {
        FilePattern::case_insensitive(pattern)
            .ok()?
            .find_first(dir)
            .ok()
            .flatten()
    };
    let lon_file = find("*Longitude.txt")?;
    let lat_file = find("*Latitude.txt")?;

    let lons = parse_numbers(&std::fs::read_to_string(&lon_file).ok()?);
    let lats = parse_numbers(&std::fs::read_to_string(&lat_file).ok()?);
    let center = centroid(&lons, &lats);
    debug!(file = %lon_file.display(), center = ?center, "Scene centre from lattice files");
    center
}

fn from_camera_xml(path: &Path) -> Option<GeoPoint> {
    let text = std::fs::read_to_string(path).ok()?;
    let inner = LLH_BLOCK.captures(&text)?.get(1)?.as_str();
    let values = parse_numbers(&XML_TAG.replace_all(inner, " "));

    let (lons, lats): (Vec<f64>, Vec<f64>) = values
        .chunks_exact(3)
        .map(|triple| (triple[0], triple[1]))
        .unzip();
    let center = centroid(&lons, &lats);
    debug!(file = %path.display(), center = ?center, "Scene centre from camera model");
    center
}

fn parse_numbers(text: &str) -> Vec<f64> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter_map(|token| token.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .collect()
}

/// Mean position; longitude uses the circular mean so antimeridian scenes
/// do not average to 0.
#[allow(clippy::cast_precision_loss)]
fn centroid(lons: &[f64], lats: &[f64]) -> Option<GeoPoint> {
    if lons.is_empty() || lats.is_empty() {
        return None;
    }
    let (sin, cos) = lons
        .iter()
        .map(|lon| lon.to_radians())
        .fold((0.0, 0.0), |(s, c), r| (s + r.sin(), c + r.cos()));
    let lon = sin.atan2(cos).to_degrees();
    let lat = lats.iter().sum::<f64>() / lats.len() as f64;

    let point = GeoPoint::new(lon, lat);
    point.is_valid().then_some(point)
}
