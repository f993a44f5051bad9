//! Point-in-polygon assignment of stops to municipalities.
//!
//! Boundary bounding boxes go into an R-tree; each stop only runs the exact
//! containment test against the polygons whose box it falls in. Containment
//! is strict (`within`): a stop on a shared edge or in a gap between polygons
//! stays unmatched.

use std::collections::BTreeMap;

use geo::{Area, BoundingRect, Contains, MultiPolygon, Point};
use rayon::prelude::*;
use rstar::{AABB, RTree, RTreeObject};
use tracing::{debug, info, warn};

use crate::boundary::{Boundary, BoundaryLayer};
use crate::crs::{self, Crs};
use crate::stops::StopPoint;

/// R-tree entry: a boundary's envelope and its position in the layer.
struct IndexedBoundary {
    slot: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedBoundary {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Outcome of locating one point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Inside exactly one polygon.
    Unique(usize),
    /// Inside several overlapping polygons; the tie-break picked this one.
    Ambiguous(usize),
    Unmatched,
}

impl Placement {
    pub fn slot(&self) -> Option<usize> {
        match self {
            Placement::Unique(slot) | Placement::Ambiguous(slot) => Some(*slot),
            Placement::Unmatched => None,
        }
    }
}

/// A boundary layer indexed for point lookups.
pub struct SpatialIndex<'a> {
    boundaries: &'a [Boundary],
    areas: Vec<f64>,
    tree: RTree<IndexedBoundary>,
    crs: Crs,
}

impl<'a> SpatialIndex<'a> {
    pub fn build(layer: &'a BoundaryLayer) -> Self {
        let entries: Vec<IndexedBoundary> = layer
            .boundaries
            .iter()
            .enumerate()
            .filter_map(|(slot, b)| {
                envelope_of(&b.geometry).map(|envelope| IndexedBoundary { slot, envelope })
            })
            .collect();
        debug!(entries = entries.len(), "Building spatial index");

        Self {
            boundaries: &layer.boundaries,
            areas: layer
                .boundaries
                .iter()
                .map(|b| b.geometry.unsigned_area())
                .collect(),
            tree: RTree::bulk_load(entries),
            crs: layer.crs,
        }
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }

    /// Finds the polygon strictly containing `point` (already in the layer CRS).
    ///
    /// Overlaps are resolved deterministically: the smallest polygon by area
    /// wins, then the lexicographically smallest code.
    pub fn locate(&self, point: Point<f64>) -> Placement {
        let query = AABB::from_point([point.x(), point.y()]);
        let mut hits = self
            .tree
            .locate_in_envelope_intersecting(&query)
            .map(|entry| entry.slot)
            .filter(|&slot| self.boundaries[slot].geometry.contains(&point));

        let Some(first) = hits.next() else {
            return Placement::Unmatched;
        };

        let mut best = first;
        let mut ambiguous = false;
        for slot in hits {
            ambiguous = true;
            if self.precedes(slot, best) {
                best = slot;
            }
        }

        if ambiguous {
            Placement::Ambiguous(best)
        } else {
            Placement::Unique(best)
        }
    }

    fn precedes(&self, a: usize, b: usize) -> bool {
        self.areas[a]
            .total_cmp(&self.areas[b])
            .then_with(|| self.boundaries[a].code.cmp(&self.boundaries[b].code))
            .is_lt()
    }

    pub fn code(&self, slot: usize) -> &str {
        &self.boundaries[slot].code
    }
}

/// Per-municipality stop counts keyed by the layer's raw code.
///
/// Municipalities without any matched stop are absent.
#[derive(Debug, Clone, Default)]
pub struct StopCounts {
    pub counts: BTreeMap<String, u64>,
    pub matched: usize,
    pub unmatched: usize,
    pub ambiguous: usize,
}

impl StopCounts {
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

/// Projects WGS84 stops into `crs`, producing new points.
///
/// Stops that cannot be projected (at the poles or off the globe) come back
/// as `None` and end up unmatched.
pub fn project_stops(stops: &[StopPoint], crs: Crs) -> Vec<Option<Point<f64>>> {
    if crs == Crs::Wgs84 {
        return stops.iter().map(|s| Some(s.lonlat())).collect();
    }
    info!(target_crs = crs.name(), "Reprojecting stops");
    stops
        .iter()
        .map(|s| {
            let p = s.lonlat();
            crs::is_projectable(p).then(|| crs.project(p))
        })
        .collect()
}

/// Assigns every stop to its enclosing municipality and counts per code.
#[tracing::instrument(skip_all, fields(stops = stops.len(), boundaries = layer.boundaries.len()))]
pub fn count_stops_per_municipality(layer: &BoundaryLayer, stops: &[StopPoint]) -> StopCounts {
    let index = SpatialIndex::build(layer);
    let points = project_stops(stops, index.crs());

    let placements: Vec<Placement> = points
        .par_iter()
        .map(|p| p.map_or(Placement::Unmatched, |p| index.locate(p)))
        .collect();

    let mut result = StopCounts::default();
    for placement in placements {
        if matches!(placement, Placement::Ambiguous(_)) {
            result.ambiguous += 1;
        }
        match placement.slot() {
            Some(slot) => {
                result.matched += 1;
                *result.counts.entry(index.code(slot).to_string()).or_insert(0) += 1;
            }
            None => result.unmatched += 1,
        }
    }

    if result.ambiguous > 0 {
        warn!(
            ambiguous = result.ambiguous,
            "Stops inside overlapping boundaries, assigned to the smallest polygon"
        );
    }
    info!(
        matched = result.matched,
        unmatched = result.unmatched,
        municipalities = result.counts.len(),
        "Spatial join complete"
    );
    result
}

fn envelope_of(geometry: &MultiPolygon<f64>) -> Option<AABB<[f64; 2]>> {
    let rect = geometry.bounding_rect()?;
    Some(AABB::from_corners(
        [rect.min().x, rect.min().y],
        [rect.max().x, rect.max().y],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Polygon, polygon};

    fn square(x0: f64, y0: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: x0, y: y0),
            (x: x0 + size, y: y0),
            (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size),
            (x: x0, y: y0),
        ]
    }

    fn layer(squares: &[(&str, Polygon<f64>)], crs: Crs) -> BoundaryLayer {
        BoundaryLayer {
            crs,
            id_column: "codgeo".to_string(),
            boundaries: squares
                .iter()
                .map(|(code, p)| Boundary {
                    code: code.to_string(),
                    geometry: MultiPolygon::new(vec![p.clone()]),
                })
                .collect(),
            skipped: 0,
        }
    }

    #[test]
    fn test_counts_points_per_polygon() {
        let layer = layer(
            &[("06088", square(7.0, 43.0, 1.0)), ("75115", square(2.0, 48.0, 1.0))],
            Crs::Wgs84,
        );
        let stops = vec![
            StopPoint::new(43.5, 7.5),
            StopPoint::new(43.2, 7.1),
            StopPoint::new(48.5, 2.5),
            StopPoint::new(10.0, 10.0),
        ];

        let counts = count_stops_per_municipality(&layer, &stops);

        assert_eq!(counts.counts["06088"], 2);
        assert_eq!(counts.counts["75115"], 1);
        assert_eq!(counts.matched, 3);
        assert_eq!(counts.unmatched, 1);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_point_on_shared_edge_is_unmatched() {
        let layer = layer(
            &[("01001", square(0.0, 0.0, 1.0)), ("01002", square(1.0, 0.0, 1.0))],
            Crs::Wgs84,
        );
        let stops = vec![StopPoint::new(0.5, 1.0)];

        let counts = count_stops_per_municipality(&layer, &stops);

        assert!(counts.counts.is_empty());
        assert_eq!(counts.unmatched, 1);
    }

    #[test]
    fn test_zero_stop_municipalities_are_absent() {
        let layer = layer(
            &[("01001", square(0.0, 0.0, 1.0)), ("01002", square(5.0, 5.0, 1.0))],
            Crs::Wgs84,
        );
        let counts = count_stops_per_municipality(&layer, &[StopPoint::new(0.5, 0.5)]);
        assert!(!counts.counts.contains_key("01002"));
    }

    #[test]
    fn test_overlap_prefers_smallest_polygon() {
        let layer = layer(
            &[("01001", square(0.0, 0.0, 4.0)), ("01002", square(1.0, 1.0, 1.0))],
            Crs::Wgs84,
        );
        let index = SpatialIndex::build(&layer);

        assert_eq!(index.locate(Point::new(1.5, 1.5)), Placement::Ambiguous(1));
        assert_eq!(index.locate(Point::new(3.0, 3.0)), Placement::Unique(0));

        let counts = count_stops_per_municipality(&layer, &[StopPoint::new(1.5, 1.5)]);
        assert_eq!(counts.ambiguous, 1);
        assert_eq!(counts.counts["01002"], 1);
    }

    #[test]
    fn test_equal_overlap_breaks_tie_by_code() {
        let layer = layer(
            &[("01009", square(0.0, 0.0, 1.0)), ("01003", square(0.0, 0.0, 1.0))],
            Crs::Wgs84,
        );
        let index = SpatialIndex::build(&layer);
        assert_eq!(index.locate(Point::new(0.5, 0.5)), Placement::Ambiguous(1));
    }

    #[test]
    fn test_reprojects_stops_into_layer_crs() {
        let nice = Crs::WebMercator.project(Point::new(7.26, 43.70));
        let layer = layer(
            &[("06088", square(nice.x() - 500.0, nice.y() - 500.0, 1000.0))],
            Crs::WebMercator,
        );

        let counts = count_stops_per_municipality(&layer, &[StopPoint::new(43.70, 7.26)]);

        assert_eq!(counts.counts["06088"], 1);
    }

    #[test]
    fn test_projection_produces_new_points() {
        let stops = vec![StopPoint::new(43.70, 7.26)];
        let projected = project_stops(&stops, Crs::Lambert93);
        assert_eq!(stops[0], StopPoint::new(43.70, 7.26));
        assert_ne!(projected[0], Some(stops[0].lonlat()));
    }
}
