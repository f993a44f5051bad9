//! Run configuration, read from an optional TOML file.
//!
//! Every section has defaults matching the public INSEE and GTFS exports, so
//! an empty file (or no file) is a valid configuration. The CLI overrides
//! individual paths on top.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::boundary;
use crate::error::{PipelineError, Result};
use crate::score::{DegenerateFallback, ScoreWeights};

/// Public GeoJSON of French communes with Paris/Lyon/Marseille split into
/// arrondissements.
pub const DEFAULT_BOUNDARY_URL: &str = "https://datavaccin-covid.ameli.fr/explore/dataset/georef-france-commune-arrondissement-municipal/download/?format=geojson&timezone=Europe/Paris&lang=fr";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub inputs: InputConfig,
    pub outputs: OutputConfig,
    pub boundaries: BoundaryConfig,
    pub scoring: ScoringConfig,
    pub filters: FilterConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub boundaries: PathBuf,
    pub stops: PathBuf,
    pub population: PathBuf,
    pub departments: Option<PathBuf>,
    pub income: PathBuf,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            boundaries: PathBuf::from("communes-plm-arrondissements.geojson"),
            stops: PathBuf::from("gtfs-stops.csv"),
            population: PathBuf::from("population_communes.csv"),
            departments: None,
            income: PathBuf::from("FILO2021_DEC_COM.csv"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub stop_counts: PathBuf,
    pub ranked: PathBuf,
    pub summary: Option<PathBuf>,
    pub scored_layer: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            stop_counts: PathBuf::from("arrets_par_commune.csv"),
            ranked: PathBuf::from("population_revenu_transport.csv"),
            summary: None,
            scored_layer: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BoundaryConfig {
    /// Identifier column names, tried in order.
    pub identifier_candidates: Vec<String>,
    pub source_url: String,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            identifier_candidates: boundary::default_candidates(),
            source_url: DEFAULT_BOUNDARY_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoreWeights,
    pub degenerate_fallback: DegenerateFallback,
    /// Rows of the ranking echoed to the log.
    pub top: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            degenerate_fallback: DegenerateFallback::default(),
            top: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Department prefixes left out of the run (overseas by default).
    pub excluded_department_prefixes: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            excluded_department_prefixes: vec!["97".to_string(), "98".to_string()],
        }
    }
}

impl PipelineConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.scoring.weights.validate()?;
        if self.boundaries.identifier_candidates.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one identifier candidate is required".to_string(),
            ));
        }
        if self
            .filters
            .excluded_department_prefixes
            .iter()
            .any(|p| p.trim().is_empty())
        {
            return Err(PipelineError::InvalidConfig(
                "excluded department prefixes must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: PipelineConfig = toml::from_str("").unwrap();
        assert_eq!(config.scoring.weights, ScoreWeights::default());
        assert_eq!(config.scoring.top, 10);
        assert_eq!(
            config.boundaries.identifier_candidates[0],
            "com_arm_code".to_string()
        );
        assert_eq!(config.filters.excluded_department_prefixes, vec!["97", "98"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_override() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [inputs]
            stops = "feeds/stops.csv"

            [scoring]
            degenerate_fallback = "half"
            weights = { income = 0.6, population = 0.3, stops = 0.1 }
            "#,
        )
        .unwrap();

        assert_eq!(config.inputs.stops, PathBuf::from("feeds/stops.csv"));
        assert_eq!(
            config.inputs.income,
            PathBuf::from("FILO2021_DEC_COM.csv")
        );
        assert_eq!(config.scoring.degenerate_fallback, DegenerateFallback::Half);
        assert_eq!(config.scoring.weights.income, 0.6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_weights_and_candidates() {
        let config: PipelineConfig =
            toml::from_str("[scoring]\nweights = { income = 1.0, population = 1.0, stops = 0.0 }")
                .unwrap();
        assert!(config.validate().is_err());

        let config: PipelineConfig =
            toml::from_str("[boundaries]\nidentifier_candidates = []").unwrap();
        assert!(config.validate().is_err());
    }
}
