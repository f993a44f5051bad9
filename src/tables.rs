//! CSV plumbing and the tabular sources joined by the merger.
//!
//! Format handling stays thin: the readers only know the header names each
//! source publishes. Bad rows are counted and skipped; a missing header or an
//! I/O failure aborts.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use csv::{ReaderBuilder, StringRecord};
use tracing::{debug, info, warn};

use crate::codes::{self, InseeCode};
use crate::error::{PipelineError, Result};

pub const POP_DEPARTMENT: &str = "Code département";
pub const POP_COMMUNE: &str = "Code commune";
pub const POP_NAME: &str = "Nom de la commune";
pub const POP_TOTAL: &str = "Population totale";
pub const DEPT_CODE: &str = "Code département";
pub const DEPT_NAME: &str = "Nom du département";
pub const INCOME_CODE: &str = "CODGEO";
pub const INCOME_MEDIAN: &str = "Q221";
pub const COUNTS_CODE: &str = "code_commune_INSEE";
pub const COUNTS_VALUE: &str = "nb_arrets";

/// Rows seen and rows rejected by a reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowStats {
    pub rows_read: usize,
    pub malformed: usize,
}

/// Picks `;` when it outnumbers `,` in the header line.
pub fn sniff_delimiter(header_line: &str) -> u8 {
    let semicolons = header_line.matches(';').count();
    let commas = header_line.matches(',').count();
    if semicolons > commas { b';' } else { b',' }
}

/// Opens a CSV file with a sniffed delimiter.
pub fn open_table(path: &Path) -> Result<csv::Reader<File>> {
    let mut first_line = String::new();
    BufReader::new(File::open(path)?).read_line(&mut first_line)?;
    let delimiter = sniff_delimiter(&first_line);
    debug!(path = %path.display(), delimiter = %(delimiter as char), "Opening table");

    Ok(ReaderBuilder::new()
        .delimiter(delimiter)
        .from_reader(File::open(path)?))
}

/// Same as [`open_table`] for in-memory data.
pub fn table_from_reader<R: Read>(reader: R, delimiter: u8) -> csv::Reader<R> {
    ReaderBuilder::new().delimiter(delimiter).from_reader(reader)
}

/// Header name to column index.
#[derive(Debug)]
pub struct Columns {
    dataset: String,
    index: HashMap<String, usize>,
}

impl Columns {
    pub fn from_reader<R: Read>(dataset: &str, rdr: &mut csv::Reader<R>) -> Result<Self> {
        let index = rdr
            .headers()?
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim_start_matches('\u{feff}').trim().to_string(), i))
            .collect();
        Ok(Self {
            dataset: dataset.to_string(),
            index,
        })
    }

    pub fn require(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::missing_field(&self.dataset, name))
    }
}

/// Drives `f` over every record, counting the ones it rejects.
///
/// `f` signals a bad row by returning [`PipelineError::MalformedRow`]; any
/// other error aborts. Records the CSV parser itself cannot split are
/// counted the same way.
pub fn for_each_record<R, F>(dataset: &str, rdr: &mut csv::Reader<R>, mut f: F) -> Result<RowStats>
where
    R: Read,
    F: FnMut(&StringRecord, u64) -> Result<()>,
{
    let mut stats = RowStats::default();

    for result in rdr.records() {
        stats.rows_read += 1;
        let record = match result {
            Ok(record) => record,
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or_default();
                let err = PipelineError::malformed(dataset, line, e.to_string());
                debug!(error = %err, "Skipping row");
                stats.malformed += 1;
                continue;
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or_default();

        match f(&record, line) {
            Ok(()) => {}
            Err(err @ PipelineError::MalformedRow { .. }) => {
                debug!(error = %err, "Skipping row");
                stats.malformed += 1;
            }
            Err(e) => return Err(e),
        }
    }

    if stats.malformed > 0 {
        warn!(dataset, malformed = stats.malformed, "Skipped malformed rows");
    }
    Ok(stats)
}

pub fn field<'r>(record: &'r StringRecord, idx: usize) -> &'r str {
    record.get(idx).unwrap_or("").trim()
}

/// Parses a count that may carry thousands separators ("2 133 111").
pub fn parse_count(raw: &str) -> Option<u64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{202f}')
        .collect();
    let cleaned = cleaned.strip_suffix(".0").unwrap_or(&cleaned);
    cleaned.parse().ok()
}

/// One population-table row after code assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct PopulationRow {
    pub code: InseeCode,
    pub name: String,
    pub department_code: String,
    pub population: u64,
}

#[derive(Debug, Clone)]
pub struct PopulationTable {
    pub rows: Vec<PopulationRow>,
    pub stats: RowStats,
    pub excluded: usize,
    pub duplicates: usize,
}

pub fn load_population(path: &Path, excluded_prefixes: &[String]) -> Result<PopulationTable> {
    read_population(&mut open_table(path)?, excluded_prefixes)
}

/// Reads the commune population sheet, dropping excluded departments before
/// assembling codes. The first row wins on a duplicate code.
pub fn read_population<R: Read>(
    rdr: &mut csv::Reader<R>,
    excluded_prefixes: &[String],
) -> Result<PopulationTable> {
    const DATASET: &str = "population table";
    let cols = Columns::from_reader(DATASET, rdr)?;
    let dept_idx = cols.require(POP_DEPARTMENT)?;
    let commune_idx = cols.require(POP_COMMUNE)?;
    let name_idx = cols.require(POP_NAME)?;
    let total_idx = cols.require(POP_TOTAL)?;

    let mut rows = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut excluded = 0;
    let mut duplicates = 0;

    let stats = for_each_record(DATASET, rdr, |record, line| {
        let dept = field(record, dept_idx);
        if codes::is_excluded_department(dept, excluded_prefixes) {
            excluded += 1;
            return Ok(());
        }

        let code = InseeCode::from_parts(dept, field(record, commune_idx))
            .map_err(|e| PipelineError::malformed(DATASET, line, e.to_string()))?;
        let population = parse_count(field(record, total_idx)).ok_or_else(|| {
            PipelineError::malformed(DATASET, line, "population is not a non-negative integer")
        })?;

        if !seen.insert(code.clone()) {
            warn!(code = %code, line, "Duplicate municipality in population table, keeping first");
            duplicates += 1;
            return Ok(());
        }

        rows.push(PopulationRow {
            department_code: code.department().to_string(),
            code,
            name: field(record, name_idx).to_string(),
            population,
        });
        Ok(())
    })?;

    info!(
        municipalities = rows.len(),
        excluded, duplicates, "Population table loaded"
    );
    Ok(PopulationTable {
        rows,
        stats,
        excluded,
        duplicates,
    })
}

pub fn load_departments(path: &Path) -> Result<HashMap<String, String>> {
    read_departments(&mut open_table(path)?)
}

/// Department code (two characters) to department name.
pub fn read_departments<R: Read>(rdr: &mut csv::Reader<R>) -> Result<HashMap<String, String>> {
    const DATASET: &str = "department table";
    let cols = Columns::from_reader(DATASET, rdr)?;
    let code_idx = cols.require(DEPT_CODE)?;
    let name_idx = cols.require(DEPT_NAME)?;

    let mut names = HashMap::new();
    for_each_record(DATASET, rdr, |record, line| {
        let code = field(record, code_idx);
        if code.is_empty() {
            return Err(PipelineError::malformed(DATASET, line, "empty department code"));
        }
        names
            .entry(codes::normalize_department(code))
            .or_insert_with(|| field(record, name_idx).to_string());
        Ok(())
    })?;

    info!(departments = names.len(), "Department names loaded");
    Ok(names)
}

#[derive(Debug, Clone)]
pub struct IncomeTable {
    /// `None` when the published median is not numeric (secret/suppressed).
    pub median_by_code: HashMap<InseeCode, Option<f64>>,
    pub stats: RowStats,
    pub duplicates: usize,
}

pub fn load_income(path: &Path) -> Result<IncomeTable> {
    read_income(&mut open_table(path)?)
}

pub fn read_income<R: Read>(rdr: &mut csv::Reader<R>) -> Result<IncomeTable> {
    const DATASET: &str = "income table";
    let cols = Columns::from_reader(DATASET, rdr)?;
    let code_idx = cols.require(INCOME_CODE)?;
    let median_idx = cols.require(INCOME_MEDIAN)?;

    let mut median_by_code = HashMap::new();
    let mut duplicates = 0;

    let stats = for_each_record(DATASET, rdr, |record, line| {
        let code = InseeCode::parse(field(record, code_idx))
            .map_err(|e| PipelineError::malformed(DATASET, line, e.to_string()))?;
        let median = field(record, median_idx)
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite());

        if median_by_code.contains_key(&code) {
            duplicates += 1;
            return Ok(());
        }
        median_by_code.insert(code, median);
        Ok(())
    })?;

    let nulls = median_by_code.values().filter(|v| v.is_none()).count();
    info!(
        municipalities = median_by_code.len(),
        null_medians = nulls,
        duplicates,
        "Income table loaded"
    );
    Ok(IncomeTable {
        median_by_code,
        stats,
        duplicates,
    })
}

pub fn load_stop_counts(path: &Path) -> Result<BTreeMap<InseeCode, u64>> {
    read_stop_counts(&mut open_table(path)?)
}

/// Reads the per-municipality stop counts written by the counting stage.
pub fn read_stop_counts<R: Read>(rdr: &mut csv::Reader<R>) -> Result<BTreeMap<InseeCode, u64>> {
    const DATASET: &str = "stop counts";
    let cols = Columns::from_reader(DATASET, rdr)?;
    let code_idx = cols.require(COUNTS_CODE)?;
    let value_idx = cols.require(COUNTS_VALUE)?;

    let mut counts = BTreeMap::new();
    for_each_record(DATASET, rdr, |record, line| {
        let code = InseeCode::parse(field(record, code_idx))
            .map_err(|e| PipelineError::malformed(DATASET, line, e.to_string()))?;
        let count = parse_count(field(record, value_idx))
            .ok_or_else(|| PipelineError::malformed(DATASET, line, "stop count is not an integer"))?;
        *counts.entry(code).or_insert(0) += count;
        Ok(())
    })?;

    info!(municipalities = counts.len(), "Stop counts loaded");
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(data: &str) -> csv::Reader<&[u8]> {
        let first = data.lines().next().unwrap_or("");
        table_from_reader(data.as_bytes(), sniff_delimiter(first))
    }

    fn metro() -> Vec<String> {
        vec!["97".to_string(), "98".to_string()]
    }

    #[test]
    fn test_sniff_delimiter() {
        assert_eq!(sniff_delimiter("CODGEO;Q221;LIBGEO"), b';');
        assert_eq!(sniff_delimiter("stop_id,stop_lat,stop_lon"), b',');
        assert_eq!(sniff_delimiter("single"), b',');
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("2 133 111"), Some(2_133_111));
        assert_eq!(parse_count("42"), Some(42));
        assert_eq!(parse_count("42.0"), Some(42));
        assert_eq!(parse_count("-3"), None);
        assert_eq!(parse_count(""), None);
    }

    #[test]
    fn test_population_assembles_codes_and_filters_overseas() {
        let data = "Code département;Code commune;Nom de la commune;Population totale\n\
                    6;88;Nice;348085\n\
                    75;115;Paris 15e Arrondissement;233484\n\
                    971;1;Les Abymes;53000\n\
                    1;1;L'Abergement-Clémenciat;859\n";
        let table = read_population(&mut reader(data), &metro()).unwrap();

        let codes: Vec<&str> = table.rows.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["06088", "75115", "01001"]);
        assert_eq!(table.excluded, 1);
        assert_eq!(table.rows[0].department_code, "06");
        assert_eq!(table.rows[0].population, 348_085);
    }

    #[test]
    fn test_population_skips_malformed_and_duplicates() {
        let data = "Code département,Code commune,Nom de la commune,Population totale\n\
                    6,88,Nice,348085\n\
                    6,88,Nice bis,1\n\
                    6,89,Broken,not-a-number\n\
                    6,90,Short\n";
        let table = read_population(&mut reader(data), &metro()).unwrap();

        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.duplicates, 1);
        assert_eq!(table.stats.malformed, 2);
        assert_eq!(table.stats.rows_read, 4);
    }

    #[test]
    fn test_population_requires_columns() {
        let data = "Code département,Nom de la commune,Population totale\n6,Nice,1\n";
        let err = read_population(&mut reader(data), &metro()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingRequiredField { ref field, .. } if field == "Code commune"));
    }

    #[test]
    fn test_departments_pad_codes() {
        let data = "Code département;Nom du département\n6;Alpes-Maritimes\n75;Paris\n2A;Corse-du-Sud\n";
        let names = read_departments(&mut reader(data)).unwrap();
        assert_eq!(names["06"], "Alpes-Maritimes");
        assert_eq!(names["75"], "Paris");
        assert_eq!(names["2A"], "Corse-du-Sud");
    }

    #[test]
    fn test_income_coerces_non_numeric_to_null() {
        let data = "CODGEO;Q221\n6088;22410\n75115;s\n75115;99999\n";
        let table = read_income(&mut reader(data)).unwrap();

        let nice = InseeCode::parse("06088").unwrap();
        let paris = InseeCode::parse("75115").unwrap();
        assert_eq!(table.median_by_code[&nice], Some(22410.0));
        assert_eq!(table.median_by_code[&paris], None);
        assert_eq!(table.duplicates, 1);
    }

    #[test]
    fn test_stop_counts_round_trip_format() {
        let data = "code_commune_INSEE,nb_arrets\n06088,12\n75115,40\n";
        let counts = read_stop_counts(&mut reader(data)).unwrap();
        assert_eq!(counts[&InseeCode::parse("6088").unwrap()], 12);
        assert_eq!(counts.len(), 2);
    }
}
