//! Output formatting and persistence for the ranked table.
//!
//! Every file goes to a sibling `.tmp` path first and is renamed into place
//! once fully written, so a failed run never leaves a truncated export.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use csv::WriterBuilder;
use geojson::{Feature, FeatureCollection, GeoJson, JsonObject};
use serde::Serialize;
use tracing::{debug, info};

use crate::boundary::BoundaryLayer;
use crate::codes::InseeCode;
use crate::crs::Crs;
use crate::error::Result;
use crate::score::MunicipalityRecord;

/// Column order of the ranked export.
pub const RANKED_COLUMNS: [&str; 7] = [
    "code_insee",
    "nom_commune",
    "nom_departement",
    "population",
    "revenu_median",
    "nb_arrets",
    "score_attractivite",
];

#[derive(Serialize)]
struct StopCountRow<'a> {
    #[serde(rename = "code_commune_INSEE")]
    code: &'a InseeCode,
    nb_arrets: u64,
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// A fully written temp file waiting to be renamed over its target.
///
/// Dropping it without [`PendingWrite::commit`] removes the temp file, so a
/// run that fails halfway leaves none of its outputs behind.
#[must_use = "staged output is discarded unless committed"]
#[derive(Debug)]
pub struct PendingWrite {
    tmp: PathBuf,
    path: PathBuf,
    committed: bool,
}

impl PendingWrite {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn commit(mut self) -> Result<()> {
        fs::rename(&self.tmp, &self.path)?;
        self.committed = true;
        debug!(path = %self.path.display(), "File written");
        Ok(())
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

/// Runs `write` against the temp sibling of `path` without touching `path`.
pub fn stage<F>(path: &Path, write: F) -> Result<PendingWrite>
where
    F: FnOnce(BufWriter<File>) -> Result<()>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    let file = File::create(&tmp)?;
    let pending = PendingWrite {
        tmp,
        path: path.to_path_buf(),
        committed: false,
    };

    write(BufWriter::new(file))?;
    Ok(pending)
}

/// Runs `write` against a temp file, then renames it over `path`.
pub fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(BufWriter<File>) -> Result<()>,
{
    stage(path, write)?.commit()
}

/// Stages `code_commune_INSEE,nb_arrets`, sorted by code.
pub fn stage_stop_counts(path: &Path, counts: &BTreeMap<InseeCode, u64>) -> Result<PendingWrite> {
    stage(path, |out| {
        let mut writer = WriterBuilder::new().from_writer(out);
        for (code, &nb_arrets) in counts {
            writer.serialize(StopCountRow { code, nb_arrets })?;
        }
        writer.flush()?;
        Ok(())
    })
}

pub fn write_stop_counts(path: &Path, counts: &BTreeMap<InseeCode, u64>) -> Result<()> {
    stage_stop_counts(path, counts)?.commit()?;
    info!(path = %path.display(), rows = counts.len(), "Stop counts exported");
    Ok(())
}

/// Stages the ranked table with the headers in [`RANKED_COLUMNS`] order.
///
/// A missing median income is an empty cell.
pub fn stage_ranked(path: &Path, records: &[MunicipalityRecord]) -> Result<PendingWrite> {
    stage(path, |out| {
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(out);
        writer.write_record(RANKED_COLUMNS)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    })
}

pub fn write_ranked(path: &Path, records: &[MunicipalityRecord]) -> Result<()> {
    stage_ranked(path, records)?.commit()?;
    info!(path = %path.display(), rows = records.len(), "Ranked table exported");
    Ok(())
}

/// Stages any serializable value as pretty JSON.
pub fn stage_json(path: &Path, value: &impl Serialize) -> Result<PendingWrite> {
    stage(path, |mut out| {
        serde_json::to_writer_pretty(&mut out, value)?;
        out.flush()?;
        Ok(())
    })
}

/// Logs the first `n` rows of the ranking.
pub fn log_top(records: &[MunicipalityRecord], n: usize) {
    for (rank, r) in records.iter().take(n).enumerate() {
        info!(
            rank = rank + 1,
            code = %r.code,
            name = %r.name,
            department = %r.department_name,
            score = r.score,
            population = r.population,
            median_income = ?r.median_income,
            stops = r.stop_count,
            "Top municipality"
        );
    }
}

/// Builds the boundary layer with ranked attributes attached, for an
/// external choropleth renderer.
///
/// Boundaries in excluded departments are left out. A boundary with no
/// ranked row still appears, with a score of 0.
pub fn scored_layer(
    layer: &BoundaryLayer,
    records: &[MunicipalityRecord],
    excluded_prefixes: &[String],
) -> Result<FeatureCollection> {
    let by_code: BTreeMap<&InseeCode, &MunicipalityRecord> =
        records.iter().map(|r| (&r.code, r)).collect();

    let mut features = Vec::with_capacity(layer.boundaries.len());
    for boundary in &layer.boundaries {
        let Ok(code) = InseeCode::parse(&boundary.code) else {
            continue;
        };
        if code.has_prefix(excluded_prefixes) {
            continue;
        }

        let properties = match by_code.get(&code) {
            Some(record) => match serde_json::to_value(record)? {
                serde_json::Value::Object(map) => map,
                _ => JsonObject::new(),
            },
            None => {
                let mut map = JsonObject::new();
                map.insert("code_insee".to_string(), code.as_str().into());
                map.insert("score_attractivite".to_string(), 0.0.into());
                map
            }
        };

        features.push(Feature {
            bbox: None,
            geometry: Some(geojson::Geometry::new(geojson::Value::from(
                &boundary.geometry,
            ))),
            id: None,
            properties: Some(properties),
            foreign_members: None,
        });
    }

    let foreign_members = (layer.crs != Crs::Wgs84).then(|| {
        let mut members = JsonObject::new();
        members.insert(
            "crs".to_string(),
            serde_json::json!({ "type": "name", "properties": { "name": layer.crs.name() } }),
        );
        members
    });

    Ok(FeatureCollection {
        bbox: None,
        features,
        foreign_members,
    })
}

pub fn stage_scored_layer(
    path: &Path,
    layer: &BoundaryLayer,
    records: &[MunicipalityRecord],
    excluded_prefixes: &[String],
) -> Result<PendingWrite> {
    let collection = scored_layer(layer, records, excluded_prefixes)?;
    debug!(features = collection.features.len(), "Scored layer built");
    stage(path, |mut out| {
        serde_json::to_writer(&mut out, &GeoJson::FeatureCollection(collection))?;
        out.flush()?;
        Ok(())
    })
}
