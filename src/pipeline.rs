//! The scoring run as an explicit chain of typed stages.
//!
//! `count_stops` covers boundary loading through code normalization,
//! `score_municipalities` covers the table joins and scoring. Nothing is
//! written until both halves succeed; see [`export_run`].

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::boundary::{self, BoundaryLayer};
use crate::codes::{self, InseeCode};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::merge::{self, MergeStats};
use crate::output;
use crate::score::{Metric, MunicipalityRecord, ScoreEngine, ScoredTable};
use crate::spatial::{self, StopCounts};
use crate::stops::{self, StopLoad};
use crate::tables;

/// Output of the geospatial half of the run.
#[derive(Debug, Clone)]
pub struct StopCountStage {
    pub layer: BoundaryLayer,
    pub stops: StopLoad,
    pub join: StopCounts,
    /// Join counts re-keyed by normalized code, excluded departments removed.
    pub counts: BTreeMap<InseeCode, u64>,
}

/// Output of the tabular half of the run.
#[derive(Debug, Clone)]
pub struct ScoreStage {
    pub table: ScoredTable,
    pub merge: MergeStats,
    pub population_excluded: usize,
    pub malformed_rows: usize,
}

/// Stage counts and the head of the ranking, for the JSON run summary.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub generated_at: DateTime<Utc>,
    pub boundary_column: Option<String>,
    pub boundary_crs: Option<String>,
    pub boundaries: usize,
    pub boundaries_skipped: usize,
    pub stop_rows_read: usize,
    pub stop_rows_malformed: usize,
    pub stops_missing_coordinates: usize,
    pub unique_stops: usize,
    pub stops_matched: usize,
    pub stops_unmatched: usize,
    pub stops_ambiguous: usize,
    pub municipalities: usize,
    pub population_excluded: usize,
    pub table_rows_malformed: usize,
    pub with_income: usize,
    pub with_stops: usize,
    pub degenerate_metrics: Vec<Metric>,
    pub top: Vec<MunicipalityRecord>,
}

impl RunSummary {
    pub fn new(counting: Option<&StopCountStage>, scoring: &ScoreStage, top: usize) -> Self {
        let mut summary = RunSummary {
            generated_at: Utc::now(),
            boundary_column: None,
            boundary_crs: None,
            boundaries: 0,
            boundaries_skipped: 0,
            stop_rows_read: 0,
            stop_rows_malformed: 0,
            stops_missing_coordinates: 0,
            unique_stops: 0,
            stops_matched: 0,
            stops_unmatched: 0,
            stops_ambiguous: 0,
            municipalities: scoring.table.records.len(),
            population_excluded: scoring.population_excluded,
            table_rows_malformed: scoring.malformed_rows,
            with_income: scoring.merge.with_income,
            with_stops: scoring.merge.with_stops,
            degenerate_metrics: scoring.table.degenerate.clone(),
            top: scoring.table.records.iter().take(top).cloned().collect(),
        };

        if let Some(c) = counting {
            summary.boundary_column = Some(c.layer.id_column.clone());
            summary.boundary_crs = Some(c.layer.crs.name().to_string());
            summary.boundaries = c.layer.boundaries.len();
            summary.boundaries_skipped = c.layer.skipped;
            summary.stop_rows_read = c.stops.rows_read;
            summary.stop_rows_malformed = c.stops.malformed_rows;
            summary.stops_missing_coordinates = c.stops.missing_coordinates;
            summary.unique_stops = c.stops.stops.len();
            summary.stops_matched = c.join.matched;
            summary.stops_unmatched = c.join.unmatched;
            summary.stops_ambiguous = c.join.ambiguous;
        }
        summary
    }
}

/// Boundaries + stops to normalized per-municipality stop counts.
#[tracing::instrument(skip_all)]
pub fn count_stops(config: &PipelineConfig) -> Result<StopCountStage> {
    let layer = boundary::load_boundaries(
        &config.inputs.boundaries,
        &config.boundaries.identifier_candidates,
    )?;
    let stops = stops::load_stops(&config.inputs.stops)?;
    let join = spatial::count_stops_per_municipality(&layer, &stops.stops);
    let counts = codes::normalize_counts(
        &join.counts,
        &config.filters.excluded_department_prefixes,
    );

    info!(
        municipalities_with_stops = counts.len(),
        "Stop counting finished"
    );
    Ok(StopCountStage {
        layer,
        stops,
        join,
        counts,
    })
}

/// Population, income and stop counts to the ranked table.
#[tracing::instrument(skip_all)]
pub fn score_municipalities(
    config: &PipelineConfig,
    stop_counts: &BTreeMap<InseeCode, u64>,
) -> Result<ScoreStage> {
    let engine = ScoreEngine::new(
        config.scoring.weights,
        config.scoring.degenerate_fallback,
    )?;
    let excluded = &config.filters.excluded_department_prefixes;

    let population = tables::load_population(&config.inputs.population, excluded)?;
    let department_names = match &config.inputs.departments {
        Some(path) => tables::load_departments(path)?,
        None => HashMap::new(),
    };
    let income = tables::load_income(&config.inputs.income)?;

    let (merged, merge) = merge::merge_datasets(&population, &department_names, &income, stop_counts);
    let table = engine.score(merged);

    Ok(ScoreStage {
        table,
        merge,
        population_excluded: population.excluded,
        malformed_rows: population.stats.malformed + income.stats.malformed,
    })
}

/// Full run in memory: counting, then scoring.
pub fn run(config: &PipelineConfig) -> Result<(StopCountStage, ScoreStage)> {
    config.validate()?;
    let counting = count_stops(config)?;
    let scoring = score_municipalities(config, &counting.counts)?;
    Ok((counting, scoring))
}

/// Writes every configured output of a completed run.
///
/// All files are staged first and only renamed into place once every one of
/// them has been written; on error the staged files are removed.
pub fn export_run(
    config: &PipelineConfig,
    counting: &StopCountStage,
    scoring: &ScoreStage,
) -> Result<RunSummary> {
    let excluded = &config.filters.excluded_department_prefixes;
    let summary = RunSummary::new(Some(counting), scoring, config.scoring.top);

    let mut staged = vec![
        output::stage_stop_counts(&config.outputs.stop_counts, &counting.counts)?,
        output::stage_ranked(&config.outputs.ranked, &scoring.table.records)?,
    ];
    if let Some(path) = &config.outputs.summary {
        staged.push(output::stage_json(path, &summary)?);
    }
    if let Some(path) = &config.outputs.scored_layer {
        staged.push(output::stage_scored_layer(
            path,
            &counting.layer,
            &scoring.table.records,
            excluded,
        )?);
    }

    let files = staged.len();
    for pending in staged {
        info!(path = %pending.path().display(), "Exporting");
        pending.commit()?;
    }
    info!(
        files,
        municipalities = summary.municipalities,
        "Run exported"
    );
    Ok(summary)
}
