//! Error taxonomy for the scoring pipeline.
//!
//! Dataset-level problems (unresolvable schema, missing columns, bad
//! configuration) abort the run. Row-level problems are represented by
//! [`PipelineError::MalformedRow`] so they can be logged uniformly, but the
//! loaders count and skip them instead of returning them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// None of the candidate identifier columns exist in a dataset.
    #[error(
        "no identifier column found in {dataset}: tried [{}], available [{}]",
        candidates.join(", "),
        available.join(", ")
    )]
    SchemaResolution {
        dataset: String,
        candidates: Vec<String>,
        available: Vec<String>,
    },

    /// A column the stage cannot work without is absent.
    #[error("{dataset} is missing required field '{field}'")]
    MissingRequiredField { dataset: String, field: String },

    /// A single unparsable row. Skipped and counted by the loaders.
    #[error("{dataset}: malformed row at line {line}: {reason}")]
    MalformedRow {
        dataset: String,
        line: u64,
        reason: String,
    },

    /// A metric has no spread, so min-max scaling would divide by zero.
    #[error("metric '{metric}' has zero variance, min-max normalization is undefined")]
    DegenerateNormalization { metric: String },

    #[error("invalid municipality code '{value}': {reason}")]
    InvalidCode { value: String, reason: String },

    #[error("unsupported coordinate reference system: {0}")]
    UnsupportedCrs(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    GeoJson(#[from] geojson::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl PipelineError {
    pub fn missing_field(dataset: &str, field: &str) -> Self {
        Self::MissingRequiredField {
            dataset: dataset.to_string(),
            field: field.to_string(),
        }
    }

    pub fn malformed(dataset: &str, line: u64, reason: impl Into<String>) -> Self {
        Self::MalformedRow {
            dataset: dataset.to_string(),
            line,
            reason: reason.into(),
        }
    }

    pub fn invalid_code(value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidCode {
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_resolution_message_lists_columns() {
        let err = PipelineError::SchemaResolution {
            dataset: "boundaries".to_string(),
            candidates: vec!["com_code".to_string(), "codgeo".to_string()],
            available: vec!["nom".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("com_code, codgeo"));
        assert!(msg.contains("[nom]"));
    }

    #[test]
    fn test_missing_field_names_dataset_and_field() {
        let err = PipelineError::missing_field("stops", "stop_lat");
        assert_eq!(err.to_string(), "stops is missing required field 'stop_lat'");
    }
}
