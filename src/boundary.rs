//! Administrative boundary loading.
//!
//! The layer is a GeoJSON `FeatureCollection` whose identifier property
//! name depends on who published it. [`resolve_identifier_column`] picks the
//! first candidate present; everything except that column and the geometry
//! is dropped.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use geo::{Geometry, MultiPolygon};
use geojson::{FeatureCollection, GeoJson};
use tracing::{debug, info};

use crate::crs::Crs;
use crate::error::{PipelineError, Result};

const DATASET: &str = "boundary layer";

/// Identifier column names, most specific first.
///
/// `com_arm_code` carries Paris/Lyon/Marseille arrondissement codes and must
/// win over the city-level `com_code` when a layer has both.
pub const DEFAULT_IDENTIFIER_CANDIDATES: &[&str] =
    &["com_arm_code", "com_code", "insee_com", "code_insee", "codgeo"];

/// One municipality polygon, keyed by its raw (not yet padded) code.
#[derive(Debug, Clone)]
pub struct Boundary {
    pub code: String,
    pub geometry: MultiPolygon<f64>,
}

#[derive(Debug, Clone)]
pub struct BoundaryLayer {
    pub crs: Crs,
    pub id_column: String,
    pub boundaries: Vec<Boundary>,
    /// Features dropped for a missing identifier or a non-polygonal geometry.
    pub skipped: usize,
}

/// Maps a set of column names to the single identifier column.
pub fn resolve_identifier_column<'a, I, S>(
    dataset: &str,
    columns: I,
    candidates: &'a [String],
) -> Result<&'a str>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let available: BTreeSet<String> = columns
        .into_iter()
        .map(|c| c.as_ref().to_string())
        .collect();

    candidates
        .iter()
        .find(|c| available.contains(c.as_str()))
        .map(String::as_str)
        .ok_or_else(|| PipelineError::SchemaResolution {
            dataset: dataset.to_string(),
            candidates: candidates.to_vec(),
            available: available.into_iter().collect(),
        })
}

/// Reads a GeoJSON boundary layer from disk.
#[tracing::instrument(skip(candidates), fields(path = %path.display()))]
pub fn load_boundaries(path: &Path, candidates: &[String]) -> Result<BoundaryLayer> {
    let file = File::open(path)?;
    let geojson = GeoJson::from_reader(BufReader::new(file))?;
    boundaries_from_geojson(geojson, candidates)
}

pub fn boundaries_from_geojson(geojson: GeoJson, candidates: &[String]) -> Result<BoundaryLayer> {
    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => {
            return Err(PipelineError::InvalidGeometry(
                "boundary layer must be a FeatureCollection".to_string(),
            ));
        }
    };

    let crs = declared_crs(&collection)?;

    let columns: BTreeSet<&str> = collection
        .features
        .iter()
        .filter_map(|f| f.properties.as_ref())
        .flat_map(|props| props.keys().map(String::as_str))
        .collect();
    let id_column = resolve_identifier_column(DATASET, columns, candidates)?.to_string();
    info!(column = %id_column, "Identifier column resolved");

    let mut boundaries = Vec::with_capacity(collection.features.len());
    let mut skipped = 0;

    for feature in collection.features {
        let code = match feature
            .properties
            .as_ref()
            .and_then(|props| props.get(&id_column))
        {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                skipped += 1;
                continue;
            }
        };

        let Some(geometry) = feature.geometry else {
            debug!(code = %code, "Feature has no geometry");
            skipped += 1;
            continue;
        };

        let geometry: Geometry<f64> = geometry
            .value
            .try_into()
            .map_err(|e| PipelineError::InvalidGeometry(format!("{code}: {e}")))?;

        let geometry = match geometry {
            Geometry::MultiPolygon(mp) => mp,
            Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
            other => {
                debug!(code = %code, kind = ?geometry_kind(&other), "Skipping non-polygonal feature");
                skipped += 1;
                continue;
            }
        };

        if geometry.0.is_empty() {
            skipped += 1;
            continue;
        }

        boundaries.push(Boundary { code, geometry });
    }

    if boundaries.is_empty() {
        return Err(PipelineError::InvalidGeometry(
            "boundary layer contains no usable polygons".to_string(),
        ));
    }

    info!(
        boundaries = boundaries.len(),
        skipped,
        crs = crs.name(),
        "Boundary layer loaded"
    );

    Ok(BoundaryLayer {
        crs,
        id_column,
        boundaries,
        skipped,
    })
}

/// Legacy GeoJSON `crs` member; RFC 7946 layers without it are WGS84.
fn declared_crs(collection: &FeatureCollection) -> Result<Crs> {
    let name = collection
        .foreign_members
        .as_ref()
        .and_then(|m| m.get("crs"))
        .and_then(|crs| crs.get("properties"))
        .and_then(|props| props.get("name"))
        .and_then(|name| name.as_str());

    match name {
        Some(name) => Crs::from_name(name),
        None => Ok(Crs::Wgs84),
    }
}

fn geometry_kind(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) | Geometry::MultiPoint(_) => "point",
        Geometry::Line(_) | Geometry::LineString(_) | Geometry::MultiLineString(_) => "line",
        _ => "other",
    }
}

pub fn default_candidates() -> Vec<String> {
    DEFAULT_IDENTIFIER_CANDIDATES
        .iter()
        .map(|c| c.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_table() {
        let candidates = default_candidates();
        let cases: &[(&[&str], Option<&str>)] = &[
            (&["com_arm_code", "com_code", "nom"], Some("com_arm_code")),
            (&["com_code", "nom"], Some("com_code")),
            (&["insee_com", "nom_com"], Some("insee_com")),
            (&["code_insee"], Some("code_insee")),
            (&["codgeo", "libgeo"], Some("codgeo")),
            (&["CODGEO"], None),
            (&[], None),
        ];

        for (columns, expected) in cases {
            let result = resolve_identifier_column("test", columns.iter(), &candidates);
            match expected {
                Some(col) => assert_eq!(result.unwrap(), *col, "columns {columns:?}"),
                None => assert!(
                    matches!(result, Err(PipelineError::SchemaResolution { .. })),
                    "columns {columns:?}"
                ),
            }
        }
    }

    fn layer(extra: &str, features: &str) -> GeoJson {
        format!(r#"{{"type":"FeatureCollection"{extra},"features":[{features}]}}"#)
            .parse()
            .unwrap()
    }

    const SQUARE: &str =
        r#"{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,1],[0,0]]]}"#;

    #[test]
    fn test_prefers_arrondissement_column() {
        let features = format!(
            r#"{{"type":"Feature","properties":{{"com_code":"75056","com_arm_code":"75115"}},"geometry":{SQUARE}}}"#
        );
        let layer = boundaries_from_geojson(layer("", &features), &default_candidates()).unwrap();

        assert_eq!(layer.id_column, "com_arm_code");
        assert_eq!(layer.boundaries.len(), 1);
        assert_eq!(layer.boundaries[0].code, "75115");
        assert_eq!(layer.crs, Crs::Wgs84);
    }

    #[test]
    fn test_numeric_codes_and_skips() {
        let features = format!(
            r#"{{"type":"Feature","properties":{{"codgeo":6088}},"geometry":{SQUARE}}},
               {{"type":"Feature","properties":{{"codgeo":null}},"geometry":{SQUARE}}},
               {{"type":"Feature","properties":{{"codgeo":"1001"}},"geometry":{{"type":"Point","coordinates":[0,0]}}}},
               {{"type":"Feature","properties":{{"codgeo":"1002"}},"geometry":null}}"#
        );
        let layer = boundaries_from_geojson(layer("", &features), &default_candidates()).unwrap();

        assert_eq!(layer.boundaries.len(), 1);
        assert_eq!(layer.boundaries[0].code, "6088");
        assert_eq!(layer.skipped, 3);
    }

    #[test]
    fn test_missing_identifier_column_fails() {
        let features =
            format!(r#"{{"type":"Feature","properties":{{"nom":"Nice"}},"geometry":{SQUARE}}}"#);
        let err = boundaries_from_geojson(layer("", &features), &default_candidates()).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaResolution { .. }));
    }

    #[test]
    fn test_reads_declared_crs() {
        let features =
            format!(r#"{{"type":"Feature","properties":{{"codgeo":"06088"}},"geometry":{SQUARE}}}"#);
        let crs = r#","crs":{"type":"name","properties":{"name":"urn:ogc:def:crs:EPSG::2154"}}"#;
        let layer = boundaries_from_geojson(layer(crs, &features), &default_candidates()).unwrap();
        assert_eq!(layer.crs, Crs::Lambert93);
    }

    #[test]
    fn test_rejects_non_collection() {
        let geojson: GeoJson = SQUARE.parse().unwrap();
        assert!(boundaries_from_geojson(geojson, &default_candidates()).is_err());
    }
}
