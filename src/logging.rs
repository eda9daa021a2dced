/// Structured logging for the warehouse ETL.
///
/// Every event carries a `source` field naming the dataset or store it is
/// about, so a run's log can be filtered per dataset. Output goes through
/// `tracing`; the filter comes from `RUST_LOG` and defaults to
/// `epi_warehouse=info`.

use std::fmt;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "epi_warehouse=info";

// ---------------------------------------------------------------------------
// Data Source Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Countries,
    Population,
    Vaccinations,
    Covid,
    Monkeypox,
    Schema,
    Archive,
    Warehouse,
    System,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Countries => write!(f, "COUNTRIES"),
            DataSource::Population => write!(f, "POPULATION"),
            DataSource::Vaccinations => write!(f, "VACCINATIONS"),
            DataSource::Covid => write!(f, "COVID"),
            DataSource::Monkeypox => write!(f, "MONKEYPOX"),
            DataSource::Schema => write!(f, "SCHEMA"),
            DataSource::Archive => write!(f, "ARCHIVE"),
            DataSource::Warehouse => write!(f, "WAREHOUSE"),
            DataSource::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Transient - the database is restarting or not reachable yet
    Expected,
    /// Data or schema problem that a retry will not fix
    Unexpected,
    /// Cannot tell from the message
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Installs the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

// ---------------------------------------------------------------------------
// Failure Classification Helpers
// ---------------------------------------------------------------------------

/// Classify a store error message.
pub fn classify_store_failure(error_message: &str) -> FailureType {
    let message = error_message.to_ascii_lowercase();

    if message.contains("connection refused")
        || message.contains("timed out")
        || message.contains("the database system is starting up")
        || message.contains("connection reset")
    {
        FailureType::Expected
    }
    // Constraint and type errors mean the data or the DDL is wrong
    else if message.contains("violates")
        || message.contains("constraint")
        || message.contains("does not exist")
        || message.contains("syntax error")
        || message.contains("cannot bind")
    {
        FailureType::Unexpected
    }
    // Bad credentials do not fix themselves either
    else if message.contains("password authentication failed") {
        FailureType::Unexpected
    } else {
        FailureType::Unknown
    }
}

/// Log one failed connection attempt.
pub fn log_connection_attempt(
    source: DataSource,
    target: &str,
    attempt: u32,
    attempts: u32,
    error_message: &str,
) {
    let failure_type = classify_store_failure(error_message);
    let message = format!(
        "connect attempt {}/{} failed [{}]: {}",
        attempt, attempts, failure_type, error_message
    );

    match failure_type {
        FailureType::Expected => warn!(source = %source, store = target, "{}", message),
        FailureType::Unexpected => error!(source = %source, store = target, "{}", message),
        FailureType::Unknown => warn!(source = %source, store = target, "{}", message),
    }
}

/// Log a failed batch write. Always an error; the run stops here.
pub fn log_write_failure(source: DataSource, table: &str, batch: usize, error_message: &str) {
    let failure_type = classify_store_failure(error_message);
    error!(
        source = %source,
        table,
        batch,
        "write failed [{}]: {}",
        failure_type,
        error_message
    );
}

// ---------------------------------------------------------------------------
// Summary Logging
// ---------------------------------------------------------------------------

/// Log the outcome of one transformation stage.
pub fn log_stage_summary(source: DataSource, stage: &str, input: usize, kept: usize) {
    let skipped = input.saturating_sub(kept);
    let message = format!("{}: {}/{} rows kept, {} skipped", stage, kept, input, skipped);

    if input == 0 {
        warn!(source = %source, "{}: no input rows", stage);
    } else if skipped == 0 {
        info!(source = %source, "{}", message);
    } else if kept == 0 {
        error!(source = %source, "{}", message);
    } else {
        warn!(source = %source, "{}", message);
    }
}

/// Log the outcome of writing one table.
pub fn log_table_summary(source: DataSource, table: &str, attempted: usize, written: u64) {
    if attempted == 0 {
        debug!(source = %source, table, "nothing to write");
    } else {
        info!(source = %source, table, "{} rows attempted, {} inserted or updated", attempted, written);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            classify_store_failure("error connecting to server: Connection refused (os error 111)"),
            FailureType::Expected
        );
        assert_eq!(
            classify_store_failure("new row for relation \"case_report\" violates check constraint"),
            FailureType::Unexpected
        );
        assert_eq!(
            classify_store_failure("relation \"location\" does not exist"),
            FailureType::Unexpected
        );
        assert_eq!(classify_store_failure("something odd"), FailureType::Unknown);
    }

    #[test]
    fn test_source_tags_are_distinct() {
        let tags: std::collections::HashSet<String> = [
            DataSource::Countries,
            DataSource::Population,
            DataSource::Vaccinations,
            DataSource::Covid,
            DataSource::Monkeypox,
            DataSource::Schema,
            DataSource::Archive,
            DataSource::Warehouse,
            DataSource::System,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(tags.len(), 9);
    }

    #[test]
    fn test_init_logging_twice_does_not_panic() {
        init_logging();
        init_logging();
    }
}
