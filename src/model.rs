/// Core data types for the epidemiological warehouse ETL.
///
/// This module defines the shared domain model imported by all other modules:
/// the warehouse records, the fixed disease enumeration, the per-field
/// absence policy, and the error taxonomy. It contains no I/O.

use chrono::NaiveDate;
use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Absence policy
// ---------------------------------------------------------------------------

/// Vaccination rate written when the population for that day is unknown or 0.
pub const RATE_WITHOUT_POPULATION: f64 = 0.0;

/// `total_death` written when the source row leaves the death count empty.
pub const DEFAULT_TOTAL_DEATH: i64 = 0;

/// Upper bound of a valid vaccination rate, in percent.
pub const MAX_VACCINATION_RATE: f64 = 100.0;

// ---------------------------------------------------------------------------
// Diseases
// ---------------------------------------------------------------------------

/// How `total_active` is derived for a disease source.
///
/// Worldometer publishes a real active-case figure; the OWID monkeypox
/// dataset does not, so its daily new-case count stands in for it. That
/// substitution is a known accuracy caveat. The policy also names the
/// source column `total_active` is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalActivePolicy {
    /// Source carries a true active-case column.
    ActiveCases,
    /// Source only has new cases per day; used as an approximation.
    NewCasesApproximation,
}

impl TotalActivePolicy {
    pub fn is_approximation(self) -> bool {
        matches!(self, TotalActivePolicy::NewCasesApproximation)
    }

    /// Source column that feeds `total_active`.
    pub fn source_column(self) -> &'static str {
        match self {
            TotalActivePolicy::ActiveCases => "active_cases",
            TotalActivePolicy::NewCasesApproximation => "new_cases",
        }
    }
}

/// The two diseases tracked by the warehouse. One source file per disease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disease {
    Covid19,
    Monkeypox,
}

impl Disease {
    pub const ALL: [Disease; 2] = [Disease::Covid19, Disease::Monkeypox];

    /// Name stored in the `disease` table.
    pub fn name(self) -> &'static str {
        match self {
            Disease::Covid19 => "Covid-19",
            Disease::Monkeypox => "Monkeypox",
        }
    }

    pub fn total_active_policy(self) -> TotalActivePolicy {
        match self {
            Disease::Covid19 => TotalActivePolicy::ActiveCases,
            Disease::Monkeypox => TotalActivePolicy::NewCasesApproximation,
        }
    }
}

impl std::fmt::Display for Disease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Warehouse records
// ---------------------------------------------------------------------------

/// One canonical country. Unique by `country`.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub country: String,
    pub continent: String,
}

/// Population and vaccination coverage of one location on one day.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationMetric {
    pub location_ref: i32,
    pub date: NaiveDate,
    /// Millions of inhabitants; `None` outside the interpolation anchors.
    pub inhabitants: Option<f64>,
    /// Percent of inhabitants with at least one dose.
    pub vaccination_rate: Option<f64>,
}

/// Cumulative case figures of one disease in one location on one day.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseReport {
    pub location_ref: i32,
    pub disease_ref: i32,
    pub date: NaiveDate,
    pub total_confirmed: i64,
    pub total_death: i64,
    pub total_active: Option<i64>,
}

/// A source row exactly as read, before any transformation.
///
/// `source_row` is the 1-based data row number within the file (the header
/// is not counted) and is the archive table's key. `values` line up with the
/// headers of the file the row came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RawArchiveRecord {
    pub source_row: i64,
    pub values: Vec<String>,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A source file could not be read. Aborts processing of that file only.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed CSV in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: String },
    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },
}

/// A record stream does not fit its target table. The table is skipped with
/// a warning; the run continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("table '{0}' not found in schema")]
    TableNotFound(String),
    #[error("table '{table}' has none of the record's columns")]
    NoColumnOverlap { table: String },
    #[error("table '{table}' lacks key column '{column}'")]
    MissingKeyColumn { table: String, column: String },
}

/// Errors raised by a store. Connection and batch failures are fatal to a run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not connect to {target} after {attempts} attempt(s): {message}")]
    Connection {
        target: String,
        attempts: u32,
        message: String,
    },
    #[error("statement on '{table}' failed: {message}")]
    Statement { table: String, message: String },
    #[error("batch {batch} of '{table}' failed ({committed} row(s) committed before it): {source}")]
    BatchFailed {
        table: String,
        batch: usize,
        committed: u64,
        #[source]
        source: Box<StoreError>,
    },
    #[error("cannot bind '{value}' to {table}.{column} ({sql_type})")]
    Conversion {
        table: String,
        column: String,
        sql_type: String,
        value: String,
    },
    #[error("query on '{table}' failed: {message}")]
    Query { table: String, message: String },
}

/// Invalid configuration, alias artifact or coverage under strict validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("invalid country alias table: {0}")]
    Aliases(String),
    #[error("{count} country name(s) have no canonical location: {names}")]
    UnmappedCountries { count: usize, names: String },
}

/// Top-level error of a pipeline run.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disease_names_are_distinct() {
        assert_ne!(Disease::Covid19.name(), Disease::Monkeypox.name());
        assert_eq!(Disease::ALL.len(), 2);
    }

    #[test]
    fn test_total_active_policy_is_fixed_per_disease() {
        assert_eq!(
            Disease::Covid19.total_active_policy(),
            TotalActivePolicy::ActiveCases
        );
        assert!(Disease::Monkeypox.total_active_policy().is_approximation());
        assert_eq!(TotalActivePolicy::ActiveCases.source_column(), "active_cases");
        assert_eq!(TotalActivePolicy::NewCasesApproximation.source_column(), "new_cases");
    }

    #[test]
    fn test_batch_failure_message_names_table_and_batch() {
        let err = StoreError::BatchFailed {
            table: "case_report".to_string(),
            batch: 3,
            committed: 2000,
            source: Box::new(StoreError::Statement {
                table: "case_report".to_string(),
                message: "violates check constraint".to_string(),
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("batch 3"), "got: {}", msg);
        assert!(msg.contains("2000 row(s) committed"), "got: {}", msg);
    }
}
