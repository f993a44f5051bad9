//! Transit stop loading and physical-stop deduplication.
//!
//! GTFS stop exports list a stop once per route/time association, so the raw
//! row count says little about how many places a bus actually halts. Stops
//! whose coordinates agree to six decimals (about 0.11 m) are treated as the
//! same physical stop.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use geo::Point;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::tables::{self, Columns};

pub const STOP_LAT: &str = "stop_lat";
pub const STOP_LON: &str = "stop_lon";

const DATASET: &str = "stop feed";
const KEY_SCALE: f64 = 1e6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl StopPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Coordinates rounded to six decimals, as integers.
    pub fn dedup_key(&self) -> (i64, i64) {
        (
            (self.latitude * KEY_SCALE).round() as i64,
            (self.longitude * KEY_SCALE).round() as i64,
        )
    }

    /// The stop as an `(x = longitude, y = latitude)` point.
    pub fn lonlat(&self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }
}

/// Stops that survived deduplication, with the counts seen along the way.
#[derive(Debug, Clone, Default)]
pub struct StopLoad {
    pub stops: Vec<StopPoint>,
    pub rows_read: usize,
    pub malformed_rows: usize,
    pub missing_coordinates: usize,
    pub duplicates: usize,
}

#[tracing::instrument(fields(path = %path.display()))]
pub fn load_stops(path: &Path) -> Result<StopLoad> {
    read_stops(&mut tables::open_table(path)?)
}

pub fn read_stops<R: Read>(rdr: &mut csv::Reader<R>) -> Result<StopLoad> {
    let cols = Columns::from_reader(DATASET, rdr)?;
    let lat_idx = cols.require(STOP_LAT)?;
    let lon_idx = cols.require(STOP_LON)?;

    let mut raw = Vec::new();
    let mut missing_coordinates = 0;

    let stats = tables::for_each_record(DATASET, rdr, |record, line| {
        let lat = parse_coordinate(tables::field(record, lat_idx), line)?;
        let lon = parse_coordinate(tables::field(record, lon_idx), line)?;
        match (lat, lon) {
            (Some(lat), Some(lon)) => raw.push(StopPoint::new(lat, lon)),
            _ => missing_coordinates += 1,
        }
        Ok(())
    })?;

    let with_coordinates = raw.len();
    let stops = deduplicate(raw);
    let duplicates = with_coordinates - stops.len();

    info!(
        rows_read = stats.rows_read,
        malformed = stats.malformed,
        missing_coordinates,
        unique_stops = stops.len(),
        duplicates,
        "Stops deduplicated"
    );

    Ok(StopLoad {
        stops,
        rows_read: stats.rows_read,
        malformed_rows: stats.malformed,
        missing_coordinates,
        duplicates,
    })
}

/// Keeps the first stop for each rounded coordinate pair, preserving order.
pub fn deduplicate<I>(stops: I) -> Vec<StopPoint>
where
    I: IntoIterator<Item = StopPoint>,
{
    let mut seen = HashSet::new();
    stops
        .into_iter()
        .filter(|stop| seen.insert(stop.dedup_key()))
        .collect()
}

// Empty and NaN cells are missing data; anything else unparsable is a bad row.
fn parse_coordinate(raw: &str, line: u64) -> Result<Option<f64>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let value: f64 = raw
        .parse()
        .map_err(|_| PipelineError::malformed(DATASET, line, format!("bad coordinate '{raw}'")))?;
    Ok(value.is_finite().then_some(value))
}
