//! Geo point index
//!
//! Points are stored under a 52-bit interleaved geohash. A radius query
//! picks the coarsest cell size that still covers the radius, scans the
//! center cell and its eight neighbors as contiguous hash ranges, and
//! filters the candidates by great-circle distance.

use std::collections::BTreeMap;

use crate::types::{parse_f64, DocId};
use crate::{Error, Result};

const STEP_BITS: u32 = 26;
const EARTH_RADIUS_M: f64 = 6_372_797.560856;
const LAT_LIMIT: f64 = 85.051_128_78;
const METERS_PER_DEGREE: f64 = 111_320.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoUnit {
    Meters,
    Kilometers,
    Miles,
    Feet,
}

impl GeoUnit {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "m" => Ok(GeoUnit::Meters),
            "km" => Ok(GeoUnit::Kilometers),
            "mi" => Ok(GeoUnit::Miles),
            "ft" => Ok(GeoUnit::Feet),
            other => Err(Error::syntax(format!("Unknown distance unit {other}"))),
        }
    }

    pub fn to_meters(&self, v: f64) -> f64 {
        match self {
            GeoUnit::Meters => v,
            GeoUnit::Kilometers => v * 1000.0,
            GeoUnit::Miles => v * 1609.34,
            GeoUnit::Feet => v * 0.3048,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoFilter {
    pub lon: f64,
    pub lat: f64,
    pub radius: f64,
    pub unit: GeoUnit,
}

impl GeoFilter {
    pub fn radius_meters(&self) -> f64 {
        self.unit.to_meters(self.radius)
    }
}

/// Parse "lon,lat" (also accepts a space separator).
pub fn parse_point(raw: &str) -> Result<(f64, f64)> {
    let mut parts = raw.split(|c| c == ',' || c == ' ').filter(|s| !s.is_empty());
    let lon = parts.next().and_then(parse_f64);
    let lat = parts.next().and_then(parse_f64);
    match (lon, lat, parts.next()) {
        (Some(lon), Some(lat), None) => {
            validate(lon, lat)?;
            Ok((lon, lat))
        }
        _ => Err(Error::bad_argument(format!("Invalid geo string `{raw}`"))),
    }
}

pub fn validate(lon: f64, lat: f64) -> Result<()> {
    if !(-180.0..=180.0).contains(&lon) || !(-LAT_LIMIT..=LAT_LIMIT).contains(&lat) {
        return Err(Error::bad_argument(format!("Invalid geo coordinates {lon},{lat}")));
    }
    Ok(())
}

/// Great-circle distance in meters.
pub fn haversine(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (lat1r, lat2r) = (lat1.to_radians(), lat2.to_radians());
    let u = ((lat2r - lat1r) / 2.0).sin();
    let v = ((lon2 - lon1).to_radians() / 2.0).sin();
    let a = u * u + lat1r.cos() * lat2r.cos() * v * v;
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

fn cell_index(value: f64, min: f64, span: f64, step: u32) -> u64 {
    let cells = (1u64 << step) as f64;
    (((value - min) / span * cells).floor() as u64).min((1u64 << step) - 1)
}

fn interleave(lon_idx: u64, lat_idx: u64, step: u32) -> u64 {
    let mut hash = 0u64;
    for i in (0..step).rev() {
        hash = (hash << 2) | (((lon_idx >> i) & 1) << 1) | ((lat_idx >> i) & 1);
    }
    hash
}

pub fn encode(lon: f64, lat: f64) -> u64 {
    interleave(
        cell_index(lon, -180.0, 360.0, STEP_BITS),
        cell_index(lat, -LAT_LIMIT, 2.0 * LAT_LIMIT, STEP_BITS),
        STEP_BITS,
    )
}

/// Coarsest step whose cells are at least `radius` meters on each side.
fn step_for(radius: f64, lat: f64) -> u32 {
    let mut step = STEP_BITS;
    let lon_scale = lat.to_radians().cos().max(0.01);
    while step > 0 {
        let cells = (1u64 << step) as f64;
        let height = 2.0 * LAT_LIMIT / cells * METERS_PER_DEGREE;
        let width = 360.0 / cells * METERS_PER_DEGREE * lon_scale;
        if height >= radius && width >= radius {
            break;
        }
        step -= 1;
    }
    step
}

#[derive(Debug, Clone, Default)]
pub struct GeoIndex {
    points: BTreeMap<u64, Vec<(DocId, f64, f64)>>,
    num_entries: usize,
}

impl GeoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, doc_id: DocId, lon: f64, lat: f64) -> Result<()> {
        validate(lon, lat)?;
        self.points.entry(encode(lon, lat)).or_default().push((doc_id, lon, lat));
        self.num_entries += 1;
        Ok(())
    }

    fn cell_ranges(&self, filter: &GeoFilter) -> Vec<(u64, u64)> {
        let step = step_for(filter.radius_meters(), filter.lat);
        if step == 0 {
            return vec![(0, u64::MAX)];
        }
        let shift = 2 * (STEP_BITS - step);
        let cells = 1i64 << step;
        let lon_idx = cell_index(filter.lon, -180.0, 360.0, step) as i64;
        let lat_idx = cell_index(filter.lat, -LAT_LIMIT, 2.0 * LAT_LIMIT, step) as i64;
        let mut ranges = Vec::with_capacity(9);
        for dlat in -1..=1 {
            let lat = lat_idx + dlat;
            if lat < 0 || lat >= cells {
                continue;
            }
            for dlon in -1..=1 {
                let lon = (lon_idx + dlon).rem_euclid(cells);
                let cell = interleave(lon as u64, lat as u64, step);
                ranges.push((cell << shift, ((cell + 1) << shift) - 1));
            }
        }
        ranges.sort_unstable();
        ranges.dedup();
        ranges
    }

    /// Ids within the filter radius, ascending.
    pub fn query(&self, filter: &GeoFilter) -> Vec<DocId> {
        let radius = filter.radius_meters();
        let mut ids: Vec<DocId> = self
            .cell_ranges(filter)
            .into_iter()
            .flat_map(|(lo, hi)| self.points.range(lo..=hi))
            .flat_map(|(_, entries)| entries.iter())
            .filter(|(_, lon, lat)| haversine(filter.lon, filter.lat, *lon, *lat) <= radius)
            .map(|(id, _, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn estimate(&self, filter: &GeoFilter) -> usize {
        self.cell_ranges(filter)
            .into_iter()
            .flat_map(|(lo, hi)| self.points.range(lo..=hi))
            .map(|(_, entries)| entries.len())
            .sum()
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn memory_usage(&self) -> usize {
        self.num_entries * std::mem::size_of::<(DocId, f64, f64)>()
            + self.points.len() * std::mem::size_of::<u64>()
    }

    pub fn collect_garbage(&mut self, dead: &[DocId]) -> usize {
        let mut removed = 0;
        self.points.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(id, _, _)| dead.binary_search(id).is_err());
            removed += before - entries.len();
            !entries.is_empty()
        });
        self.num_entries -= removed;
        removed * std::mem::size_of::<(DocId, f64, f64)>()
    }
}
