//! Left join of population, income and stop counts on the normalized code.

use std::collections::{BTreeMap, HashMap};

use tracing::info;

use crate::codes::InseeCode;
use crate::tables::{IncomeTable, PopulationTable};

/// A municipality with all three signals attached, before scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedMunicipality {
    pub code: InseeCode,
    pub name: String,
    pub department_name: String,
    pub population: u64,
    pub median_income: Option<f64>,
    pub stop_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub rows: usize,
    pub with_income: usize,
    pub with_stops: usize,
}

/// Joins onto the population table, which keeps its rows and their order.
///
/// Missing income stays `None`; a municipality absent from the stop counts
/// has no stops, so it gets 0.
#[tracing::instrument(skip_all, fields(population = population.rows.len()))]
pub fn merge_datasets(
    population: &PopulationTable,
    department_names: &HashMap<String, String>,
    income: &IncomeTable,
    stop_counts: &BTreeMap<InseeCode, u64>,
) -> (Vec<MergedMunicipality>, MergeStats) {
    let mut stats = MergeStats::default();

    let merged: Vec<MergedMunicipality> = population
        .rows
        .iter()
        .map(|row| {
            let median_income = income.median_by_code.get(&row.code).copied().flatten();
            let stop_count = stop_counts.get(&row.code).copied();

            stats.with_income += usize::from(median_income.is_some());
            stats.with_stops += usize::from(stop_count.is_some());

            MergedMunicipality {
                code: row.code.clone(),
                name: row.name.clone(),
                department_name: department_names
                    .get(&row.department_code)
                    .cloned()
                    .unwrap_or_default(),
                population: row.population,
                median_income,
                stop_count: stop_count.unwrap_or(0),
            }
        })
        .collect();

    stats.rows = merged.len();
    info!(
        rows = stats.rows,
        with_income = stats.with_income,
        with_stops = stats.with_stops,
        "Datasets merged"
    );
    (merged, stats)
}
