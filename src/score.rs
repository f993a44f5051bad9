//! Min-max normalization and the weighted attractiveness score.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::codes::InseeCode;
use crate::error::{PipelineError, Result};
use crate::merge::MergedMunicipality;

/// Relative weights of the three signals. Must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub income: f64,
    pub population: f64,
    pub stops: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            income: 0.5,
            population: 0.4,
            stops: 0.1,
        }
    }
}

impl ScoreWeights {
    pub fn validate(&self) -> Result<()> {
        let all = [self.income, self.population, self.stops];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "weights must be finite and non-negative, got {self:?}"
            )));
        }
        let sum: f64 = all.iter().sum();
        if (sum - 1.0).abs() > 1e-9 {
            return Err(PipelineError::InvalidConfig(format!(
                "weights must sum to 1, got {sum}"
            )));
        }
        Ok(())
    }
}

/// Value given to every row of a metric that has no spread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegenerateFallback {
    #[default]
    Zero,
    Half,
}

impl DegenerateFallback {
    pub fn value(&self) -> f64 {
        match self {
            DegenerateFallback::Zero => 0.0,
            DegenerateFallback::Half => 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Income,
    Population,
    StopCount,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Income => "median_income",
            Metric::Population => "population",
            Metric::StopCount => "stop_count",
        }
    }
}

/// Observed range of a metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    /// Min and max over the present, finite values.
    ///
    /// Fails when the range is empty or zero-width.
    pub fn of<I>(metric: Metric, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = Option<f64>>,
    {
        let (min, max) = values
            .into_iter()
            .flatten()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });

        if min.is_finite() && max > min {
            Ok(Self { min, max })
        } else {
            Err(PipelineError::DegenerateNormalization {
                metric: metric.name().to_string(),
            })
        }
    }

    pub fn normalize(&self, value: f64) -> f64 {
        ((value - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
    }
}

/// How one metric is turned into [0, 1] for the whole run.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Scale {
    MinMax(Bounds),
    Constant(f64),
}

impl Scale {
    fn resolve<I>(metric: Metric, values: I, fallback: DegenerateFallback) -> (Self, bool)
    where
        I: IntoIterator<Item = Option<f64>>,
    {
        match Bounds::of(metric, values) {
            Ok(bounds) => (Scale::MinMax(bounds), false),
            Err(e) => {
                warn!(error = %e, fallback = fallback.value(), "Using constant normalization");
                (Scale::Constant(fallback.value()), true)
            }
        }
    }

    // A null value normalizes to 0 so it adds nothing to the score.
    fn apply(&self, value: Option<f64>) -> f64 {
        match (self, value) {
            (_, None) => 0.0,
            (Scale::MinMax(bounds), Some(v)) => bounds.normalize(v),
            (Scale::Constant(c), Some(_)) => *c,
        }
    }
}

/// Final, immutable row of the ranked table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MunicipalityRecord {
    #[serde(rename = "code_insee")]
    pub code: InseeCode,
    #[serde(rename = "nom_commune")]
    pub name: String,
    #[serde(rename = "nom_departement")]
    pub department_name: String,
    pub population: u64,
    #[serde(rename = "revenu_median")]
    pub median_income: Option<f64>,
    #[serde(rename = "nb_arrets")]
    pub stop_count: u64,
    #[serde(rename = "score_attractivite")]
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredTable {
    /// Sorted by descending score; ties keep population-table order.
    pub records: Vec<MunicipalityRecord>,
    pub degenerate: Vec<Metric>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreEngine {
    pub weights: ScoreWeights,
    pub fallback: DegenerateFallback,
}

impl ScoreEngine {
    pub fn new(weights: ScoreWeights, fallback: DegenerateFallback) -> Result<Self> {
        weights.validate()?;
        Ok(Self { weights, fallback })
    }

    #[tracing::instrument(skip_all, fields(rows = rows.len()))]
    pub fn score(&self, rows: Vec<MergedMunicipality>) -> ScoredTable {
        let mut degenerate = Vec::new();
        let mut scale_for = |metric: Metric, values: Vec<Option<f64>>| {
            let (scale, fell_back) = Scale::resolve(metric, values, self.fallback);
            if fell_back {
                degenerate.push(metric);
            }
            scale
        };

        let income = scale_for(
            Metric::Income,
            rows.iter().map(|r| r.median_income).collect(),
        );
        let population = scale_for(
            Metric::Population,
            rows.iter().map(|r| Some(r.population as f64)).collect(),
        );
        let stops = scale_for(
            Metric::StopCount,
            rows.iter().map(|r| Some(r.stop_count as f64)).collect(),
        );

        let mut records: Vec<MunicipalityRecord> = rows
            .into_iter()
            .map(|row| {
                let composite = self.weights.income * income.apply(row.median_income)
                    + self.weights.population * population.apply(Some(row.population as f64))
                    + self.weights.stops * stops.apply(Some(row.stop_count as f64));

                MunicipalityRecord {
                    score: round2(100.0 * composite).clamp(0.0, 100.0),
                    code: row.code,
                    name: row.name,
                    department_name: row.department_name,
                    population: row.population,
                    median_income: row.median_income,
                    stop_count: row.stop_count,
                }
            })
            .collect();

        // sort_by is stable, so equal scores keep their input order.
        records.sort_by(|a, b| b.score.total_cmp(&a.score));

        info!(
            rows = records.len(),
            degenerate = degenerate.len(),
            "Scores computed"
        );
        ScoredTable {
            records,
            degenerate,
        }
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(code: &str, income: Option<f64>, population: u64, stops: u64) -> MergedMunicipality {
        MergedMunicipality {
            code: InseeCode::parse(code).unwrap(),
            name: code.to_string(),
            department_name: String::new(),
            population,
            median_income: income,
            stop_count: stops,
        }
    }

    fn score_of<'a>(table: &'a ScoredTable, code: &str) -> &'a MunicipalityRecord {
        table
            .records
            .iter()
            .find(|r| r.code.as_str() == code)
            .unwrap()
    }

    #[test]
    fn test_middle_municipality_scores_fifty() {
        let rows = vec![
            row("01001", Some(10_000.0), 100, 0),
            row("01002", Some(20_000.0), 200, 5),
            row("01003", Some(30_000.0), 300, 10),
        ];
        let table = ScoreEngine::default().score(rows);

        assert_eq!(score_of(&table, "01002").score, 50.0);
        assert_eq!(score_of(&table, "01001").score, 0.0);
        assert_eq!(score_of(&table, "01003").score, 100.0);
        assert!(table.degenerate.is_empty());
    }

    #[test]
    fn test_sorted_descending() {
        let rows = vec![
            row("01001", Some(10_000.0), 100, 0),
            row("01003", Some(30_000.0), 300, 10),
            row("01002", Some(20_000.0), 200, 5),
        ];
        let table = ScoreEngine::default().score(rows);
        let codes: Vec<&str> = table.records.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["01003", "01002", "01001"]);
    }

    #[test]
    fn test_ties_keep_input_order() {
        let rows = vec![
            row("01009", Some(10.0), 5, 1),
            row("01001", Some(10.0), 5, 1),
            row("01005", Some(20.0), 9, 3),
            row("01002", Some(10.0), 5, 1),
        ];
        let table = ScoreEngine::default().score(rows);
        let codes: Vec<&str> = table.records.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["01005", "01009", "01001", "01002"]);
    }

    #[test]
    fn test_null_income_does_not_poison_scores() {
        let rows = vec![
            row("01001", None, 300, 10),
            row("01002", Some(10_000.0), 100, 0),
            row("01003", Some(30_000.0), 200, 5),
        ];
        let table = ScoreEngine::default().score(rows);

        let missing = score_of(&table, "01001");
        assert!(missing.score.is_finite());
        assert_eq!(missing.score, 50.0);
        assert_eq!(missing.median_income, None);
        assert_eq!(score_of(&table, "01003").score, 75.0);
    }

    #[test]
    fn test_constant_metric_uses_fallback() {
        let rows = vec![
            row("01001", Some(10_000.0), 100, 0),
            row("01002", Some(20_000.0), 100, 0),
        ];
        let table = ScoreEngine::default().score(rows);
        assert_eq!(table.degenerate, vec![Metric::Population, Metric::StopCount]);
        assert_eq!(score_of(&table, "01002").score, 50.0);
        assert_eq!(score_of(&table, "01001").score, 0.0);

        let half = ScoreEngine::new(ScoreWeights::default(), DegenerateFallback::Half).unwrap();
        let rows = vec![
            row("01001", Some(10_000.0), 100, 0),
            row("01002", Some(20_000.0), 100, 0),
        ];
        let table = half.score(rows);
        assert_eq!(score_of(&table, "01001").score, 25.0);
    }

    #[test]
    fn test_all_income_null_is_degenerate() {
        let rows = vec![row("01001", None, 100, 0), row("01002", None, 200, 4)];
        let table = ScoreEngine::default().score(rows);
        assert!(table.degenerate.contains(&Metric::Income));
        assert_eq!(score_of(&table, "01002").score, 50.0);
    }

    #[test]
    fn test_scores_stay_in_bounds() {
        let rows: Vec<_> = (0..50)
            .map(|i| {
                let income = (i % 7 != 0).then_some(1_000.0 * (i as f64).sqrt());
                row(&format!("{:05}", 1000 + i), income, i * 37 % 101, i * 13 % 17)
            })
            .collect();
        let table = ScoreEngine::default().score(rows);
        assert!(table.records.iter().all(|r| (0.0..=100.0).contains(&r.score)));
    }

    #[test]
    fn test_bounds_reject_zero_width() {
        let err = Bounds::of(Metric::Population, vec![Some(3.0), Some(3.0)]).unwrap_err();
        assert!(matches!(err, PipelineError::DegenerateNormalization { .. }));
        assert!(Bounds::of(Metric::Income, vec![None, None]).is_err());
    }

    #[test]
    fn test_weights_validation() {
        assert!(ScoreWeights::default().validate().is_ok());
        let bad = ScoreWeights {
            income: 0.6,
            population: 0.4,
            stops: 0.1,
        };
        assert!(bad.validate().is_err());
        let negative = ScoreWeights {
            income: 1.2,
            population: -0.2,
            stops: 0.0,
        };
        assert!(ScoreEngine::new(negative, DegenerateFallback::Zero).is_err());
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(12.345_6), 12.35);
        assert_eq!(round2(0.004), 0.0);
    }
}
