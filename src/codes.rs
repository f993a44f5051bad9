//! Municipality identifier normalization.
//!
//! Every source spells the INSEE commune code differently: a single
//! (possibly unpadded) field in the boundary layer and the income table, or a
//! department/commune pair in the population table. Both shapes are reduced
//! to the same five-character key here.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Serializer};
use tracing::warn;

use crate::error::{PipelineError, Result};

pub const CODE_WIDTH: usize = 5;
const DEPARTMENT_WIDTH: usize = 2;
const COMMUNE_WIDTH: usize = 3;

/// A normalized five-character municipality code, e.g. `06088`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InseeCode(String);

impl InseeCode {
    pub fn parse(raw: &str) -> Result<Self> {
        normalize_code(raw).map(Self)
    }

    pub fn from_parts(department: &str, commune: &str) -> Result<Self> {
        assemble_code(department, commune).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two-character department prefix.
    pub fn department(&self) -> &str {
        &self.0[..DEPARTMENT_WIDTH]
    }

    pub fn has_prefix(&self, prefixes: &[String]) -> bool {
        prefixes.iter().any(|p| self.0.starts_with(p.as_str()))
    }
}

impl fmt::Display for InseeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for InseeCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Left-pads a single-field code to five characters.
///
/// Idempotent: a normalized code normalizes to itself.
pub fn normalize_code(raw: &str) -> Result<String> {
    let value = strip_float_suffix(raw.trim());
    pad_checked(raw, value, CODE_WIDTH)?;
    let padded = format!("{value:0>CODE_WIDTH$}");
    validate_characters(raw, &padded)?;
    Ok(padded)
}

/// Builds a code from a 1-2 character department and a 1-3 digit commune.
pub fn assemble_code(department: &str, commune: &str) -> Result<String> {
    let dept = strip_float_suffix(department.trim());
    let com = strip_float_suffix(commune.trim());
    let joined = format!("{department}/{commune}");

    pad_checked(&joined, dept, DEPARTMENT_WIDTH)?;
    pad_checked(&joined, com, COMMUNE_WIDTH)?;

    let code = format!("{dept:0>DEPARTMENT_WIDTH$}{com:0>COMMUNE_WIDTH$}");
    validate_characters(&joined, &code)?;
    Ok(code)
}

/// Normalizes the department part alone, used to join department names.
pub fn normalize_department(raw: &str) -> String {
    let value = strip_float_suffix(raw.trim());
    format!("{value:0>DEPARTMENT_WIDTH$}")
}

/// True when a raw (unpadded) department code belongs to an excluded range.
pub fn is_excluded_department(raw: &str, prefixes: &[String]) -> bool {
    let dept = raw.trim();
    prefixes.iter().any(|p| dept.starts_with(p.as_str()))
}

/// Re-keys raw join counts by normalized code.
///
/// Keys that collapse to the same code are summed, excluded prefixes are
/// dropped, unnormalizable keys are logged and dropped.
pub fn normalize_counts(
    raw: &BTreeMap<String, u64>,
    excluded_prefixes: &[String],
) -> BTreeMap<InseeCode, u64> {
    let mut normalized = BTreeMap::new();
    for (key, count) in raw {
        match InseeCode::parse(key) {
            Ok(code) if code.has_prefix(excluded_prefixes) => {}
            Ok(code) => *normalized.entry(code).or_insert(0) += count,
            Err(e) => warn!(error = %e, count, "Dropping stop count with unusable code"),
        }
    }
    normalized
}

// Spreadsheet exports turn integer codes into floats ("6088.0").
fn strip_float_suffix(value: &str) -> &str {
    value.strip_suffix(".0").unwrap_or(value)
}

fn pad_checked(raw: &str, value: &str, width: usize) -> Result<()> {
    if value.is_empty() {
        return Err(PipelineError::invalid_code(raw, "empty"));
    }
    if value.len() > width {
        return Err(PipelineError::invalid_code(
            raw,
            format!("longer than {width} characters"),
        ));
    }
    Ok(())
}

// Digits only, except the Corsican departments 2A and 2B.
fn validate_characters(raw: &str, code: &str) -> Result<()> {
    let bytes = code.as_bytes();
    let corsica = bytes.starts_with(b"2A") || bytes.starts_with(b"2B");
    let digits_from = if corsica { 2 } else { 0 };
    if bytes[digits_from..].iter().all(u8::is_ascii_digit) {
        Ok(())
    } else {
        Err(PipelineError::invalid_code(raw, "non-digit characters"))
    }
}
