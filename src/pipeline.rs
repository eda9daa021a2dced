//! Run orchestration.
//!
//! A run moves through Connecting → ArchivingRaw → TransformingAndLoading →
//! Done, strictly in order. Any fatal error moves it to Failed, recording
//! the stage it happened in; batches committed before that point stay
//! committed. Both store handles are owned by the run and dropped when it
//! returns.
//!
//! Stage order inside TransformingAndLoading:
//! Location → Disease → population interpolation → LocationMetric →
//! CaseReport (Covid-19) → CaseReport (Monkeypox).

use crate::analysis::joins::{self, JoinStats};
use crate::analysis::population;
use crate::config::{EtlConfig, SourceFile, SourcePaths, StoreRole};
use crate::countries::CountryAliases;
use crate::ingest::raw::read_raw;
use crate::ingest::sources::{self, SourceBundle};
use crate::logging::{self, DataSource};
use crate::model::{CaseReport, ConfigError, Disease, EtlError, Location, LocationMetric, StoreError};
use crate::schema::SchemaCatalog;
use crate::store::pg::PgStore;
use crate::store::{self, Store};
use crate::verify::{self, CoverageReport};
use crate::writer::{TableRecord, TableWriteReport, WarehouseWriter};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connecting,
    ArchivingRaw,
    TransformingAndLoading,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Connecting => write!(f, "Connecting"),
            Stage::ArchivingRaw => write!(f, "ArchivingRaw"),
            Stage::TransformingAndLoading => write!(f, "TransformingAndLoading"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    NotStarted,
    Running(Stage),
    Done,
    Failed { during: Stage, reason: String },
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Join statistics of one transformation step.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub source: DataSource,
    pub table: &'static str,
    pub stats: JoinStats,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: PipelineState,
    pub alias_version: u32,
    pub coverage: Option<CoverageReport>,
    /// Sources that could not be read, with the reason.
    pub source_errors: Vec<String>,
    pub archive: Vec<TableWriteReport>,
    pub joins: Vec<StageReport>,
    pub tables: Vec<TableWriteReport>,
    pub stage_timings: Vec<(Stage, Duration)>,
    pub elapsed: Duration,
}

impl RunReport {
    fn new(alias_version: u32) -> Self {
        Self {
            state: PipelineState::NotStarted,
            alias_version,
            coverage: None,
            source_errors: Vec::new(),
            archive: Vec::new(),
            joins: Vec::new(),
            tables: Vec::new(),
            stage_timings: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    fn record_join(&mut self, source: DataSource, table: &'static str, stats: JoinStats) {
        logging::log_stage_summary(source, table, stats.input, stats.kept);
        self.joins.push(StageReport { source, table, stats });
    }

    /// Write report of warehouse table `table`, if it was reached.
    pub fn table(&self, table: &str) -> Option<&TableWriteReport> {
        self.tables.iter().find(|t| t.table.eq_ignore_ascii_case(table))
    }

    pub fn join(&self, source: DataSource) -> Option<&JoinStats> {
        self.joins.iter().find(|j| j.source == source).map(|j| &j.stats)
    }

    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(60));
        println!("RUN SUMMARY (alias table v{})", self.alias_version);
        println!("{}", "=".repeat(60));

        if !self.source_errors.is_empty() {
            println!("\nUnreadable sources:");
            for e in &self.source_errors {
                println!("  ✗ {}", e);
            }
        }

        println!("\nArchive:");
        for t in &self.archive {
            print_table(t);
        }

        println!("\nTransform:");
        for j in &self.joins {
            let s = &j.stats;
            println!(
                "  {:<14} {:<16} {}/{} kept (no location {}, no population {}, missing {}, invalid {}, dropped {}, duplicates {}, malformed {})",
                j.source.to_string(),
                j.table,
                s.kept,
                s.input,
                s.skipped_no_location,
                s.skipped_no_population,
                s.skipped_missing_primary,
                s.skipped_invalid,
                s.dropped,
                s.duplicates,
                s.malformed
            );
        }

        println!("\nWarehouse:");
        for t in &self.tables {
            print_table(t);
        }

        println!();
        for (stage, took) in &self.stage_timings {
            println!("  {:<24} {:.2}s", stage.to_string(), took.as_secs_f64());
        }
        let outcome = match &self.state {
            PipelineState::Done => "DONE".to_string(),
            PipelineState::Failed { during, reason } => format!("FAILED during {}: {}", during, reason),
            other => format!("{:?}", other),
        };
        println!("\n{} in {:.2}s", outcome, self.elapsed.as_secs_f64());
        println!("{}", "=".repeat(60));
    }
}

fn print_table(t: &TableWriteReport) {
    if t.is_skipped() {
        println!("  ⚠ {:<36} skipped ({} rows)", t.table, t.skipped);
    } else {
        println!("  ✓ {:<36} {}/{} written", t.table, t.written, t.attempted);
    }
}

/// A run that stopped on a fatal error. `report` holds what was done before.
#[derive(Debug, Error)]
#[error("pipeline failed during {during}: {error}")]
pub struct RunFailure {
    pub during: Stage,
    #[source]
    pub error: EtlError,
    pub report: Box<RunReport>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    config: EtlConfig,
    aliases: CountryAliases,
    archive_catalog: SchemaCatalog,
    warehouse_catalog: SchemaCatalog,
    state: PipelineState,
}

/// The five sources with their log tags, in archive order.
fn tagged_sources(sources: &SourcePaths) -> [(DataSource, &SourceFile); 5] {
    [
        (DataSource::Countries, &sources.countries),
        (DataSource::Population, &sources.population),
        (DataSource::Vaccinations, &sources.vaccinations),
        (DataSource::Covid, &sources.covid),
        (DataSource::Monkeypox, &sources.monkeypox),
    ]
}

fn enter(stage: &mut Stage, next: Stage) {
    *stage = next;
    info!(source = %DataSource::System, "entering {}", next);
}

impl Pipeline {
    pub fn new(
        config: EtlConfig,
        aliases: CountryAliases,
        archive_catalog: SchemaCatalog,
        warehouse_catalog: SchemaCatalog,
    ) -> Self {
        Self {
            config,
            aliases,
            archive_catalog,
            warehouse_catalog,
            state: PipelineState::NotStarted,
        }
    }

    /// Loads the alias table and both DDL catalogs named in `config`.
    pub fn from_config(config: EtlConfig) -> Result<Self, ConfigError> {
        let aliases = CountryAliases::load_or_builtin(config.aliases_path.as_deref())?;
        let archive_catalog = SchemaCatalog::from_file(&config.schema.archive)?;
        let warehouse_catalog = SchemaCatalog::from_file(&config.schema.warehouse)?;
        for (role, catalog) in [
            (StoreRole::Archive, &archive_catalog),
            (StoreRole::Warehouse, &warehouse_catalog),
        ] {
            if catalog.is_empty() {
                warn!(source = %DataSource::Schema, "{} schema defines no tables", role.label());
            }
        }
        Ok(Self::new(config, aliases, archive_catalog, warehouse_catalog))
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    /// Runs against the PostgreSQL servers named in the configuration.
    pub fn run_postgres(&mut self) -> Result<RunReport, RunFailure> {
        let archive = self.config.archive.clone();
        let warehouse = self.config.warehouse.clone();
        self.run(
            move || PgStore::connect(StoreRole::Archive.label(), &archive),
            move || PgStore::connect(StoreRole::Warehouse.label(), &warehouse),
        )
    }

    /// Runs the whole pipeline. Each connector opens one connection and is
    /// retried per the configured policy.
    pub fn run<A, W, FA, FW>(
        &mut self,
        connect_archive: FA,
        connect_warehouse: FW,
    ) -> Result<RunReport, RunFailure>
    where
        A: Store,
        W: Store,
        FA: FnMut() -> Result<A, StoreError>,
        FW: FnMut() -> Result<W, StoreError>,
    {
        let started = Instant::now();
        let mut report = RunReport::new(self.aliases.version());
        let mut stage = Stage::Connecting;
        self.state = PipelineState::Running(stage);

        let result = self.execute(&mut report, &mut stage, connect_archive, connect_warehouse);
        report.elapsed = started.elapsed();

        match result {
            Ok(()) => {
                self.state = PipelineState::Done;
                report.state = PipelineState::Done;
                info!(source = %DataSource::System, "run finished in {:.2}s", report.elapsed.as_secs_f64());
                Ok(report)
            }
            Err(error) => {
                self.state = PipelineState::Failed {
                    during: stage,
                    reason: error.to_string(),
                };
                report.state = self.state.clone();
                error!(source = %DataSource::System, "run failed during {}: {}", stage, error);
                Err(RunFailure {
                    during: stage,
                    error,
                    report: Box::new(report),
                })
            }
        }
    }

    fn execute<A, W, FA, FW>(
        &self,
        report: &mut RunReport,
        stage: &mut Stage,
        connect_archive: FA,
        connect_warehouse: FW,
    ) -> Result<(), EtlError>
    where
        A: Store,
        W: Store,
        FA: FnMut() -> Result<A, StoreError>,
        FW: FnMut() -> Result<W, StoreError>,
    {
        let config = &self.config;

        enter(stage, Stage::Connecting);
        let clock = Instant::now();
        let archive = store::connect_with_retry(StoreRole::Archive, &config.retry, connect_archive)?;
        let warehouse = store::connect_with_retry(StoreRole::Warehouse, &config.retry, connect_warehouse)?;
        let mut archive = WarehouseWriter::new(archive, &self.archive_catalog, config.batch_size);
        let mut warehouse = WarehouseWriter::new(warehouse, &self.warehouse_catalog, config.batch_size);
        report.stage_timings.push((Stage::Connecting, clock.elapsed()));

        enter(stage, Stage::ArchivingRaw);
        let clock = Instant::now();
        let bundle = sources::load_bundle(config);
        report.source_errors = bundle
            .errors
            .iter()
            .map(|(source, e)| format!("{}: {}", source, e))
            .collect();

        let coverage = verify::verify_coverage(&bundle, &self.aliases);
        report.coverage = Some(coverage.clone());
        verify::enforce(&coverage, config.validation)?;

        for (source, file) in tagged_sources(&config.sources) {
            match read_raw(&file.path) {
                Ok(raw) => {
                    if raw.unreadable > 0 {
                        warn!(source = %source, "{} unreadable rows not archived", raw.unreadable);
                    }
                    report.archive.push(archive.write_raw(source, &file.archive_table, &raw)?);
                }
                Err(e) => warn!(source = %source, "not archived: {}", e),
            }
        }
        report.stage_timings.push((Stage::ArchivingRaw, clock.elapsed()));

        enter(stage, Stage::TransformingAndLoading);
        let clock = Instant::now();
        self.transform_and_load(&bundle, &mut warehouse, report)?;
        report.stage_timings.push((Stage::TransformingAndLoading, clock.elapsed()));

        Ok(())
    }

    fn transform_and_load<W: Store>(
        &self,
        bundle: &SourceBundle,
        warehouse: &mut WarehouseWriter<'_, W>,
        report: &mut RunReport,
    ) -> Result<(), EtlError> {
        let aliases = &self.aliases;

        // Location
        let (locations, stats) = joins::build_locations(&bundle.countries, aliases);
        report.record_join(DataSource::Countries, Location::TABLE, stats);
        let written = warehouse.write_records(DataSource::Countries, &locations)?;
        let location_ids = ids_if_written(warehouse, &written, "country")?;
        report.tables.push(written);

        // Disease
        let written = warehouse.write_records(DataSource::System, &Disease::ALL)?;
        let disease_ids = ids_if_written(warehouse, &written, "name")?;
        report.tables.push(written);

        // Population
        let series = population::interpolate(
            &bundle.population,
            aliases,
            self.config.interpolation_start,
            self.config.resolved_workers(),
        );
        info!(
            source = %DataSource::Population,
            "{} countries interpolated over {} days ({} to {})",
            series.len(),
            series.days(),
            series.start(),
            series.end()
        );

        // LocationMetric
        let (metrics, stats) =
            joins::build_location_metrics(&bundle.vaccinations, aliases, &location_ids, &series);
        report.record_join(DataSource::Vaccinations, LocationMetric::TABLE, stats);
        report
            .tables
            .push(warehouse.write_records(DataSource::Vaccinations, &metrics)?);

        // CaseReport, one disease at a time
        for disease in Disease::ALL {
            let source = sources::disease_source(disease);
            let rows = bundle.reports(disease);
            let Some(&disease_ref) = disease_ids.get(disease.name()) else {
                warn!(source = %source, "no id for disease '{}', {} rows not loaded", disease, rows.input());
                continue;
            };
            let (reports, stats) =
                joins::build_case_reports(rows, disease, disease_ref, aliases, &location_ids);
            report.record_join(source, CaseReport::TABLE, stats);
            report.tables.push(warehouse.write_records(source, &reports)?);
        }

        Ok(())
    }
}

/// Surrogate ids of a table just written, or none when it was skipped.
fn ids_if_written<W: Store>(
    warehouse: &mut WarehouseWriter<'_, W>,
    written: &TableWriteReport,
    key_column: &str,
) -> Result<HashMap<String, i32>, StoreError> {
    if written.is_skipped() {
        return Ok(HashMap::new());
    }
    warehouse.key_ids(&written.table, key_column)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_message_names_stage() {
        let failure = RunFailure {
            during: Stage::ArchivingRaw,
            error: EtlError::Store(StoreError::Statement {
                table: "vaccinations".to_string(),
                message: "boom".to_string(),
            }),
            report: Box::new(RunReport::new(1)),
        };
        assert!(failure.to_string().starts_with("pipeline failed during ArchivingRaw"));
    }

    #[test]
    fn test_report_lookup_is_case_insensitive() {
        let mut report = RunReport::new(1);
        report.tables.push(TableWriteReport {
            table: "location".to_string(),
            attempted: 1,
            written: 1,
            skipped: 0,
            status: crate::writer::WriteStatus::Written,
            dropped_columns: Vec::new(),
        });
        assert!(report.table("LOCATION").is_some());
        assert!(report.table("disease").is_none());
    }
}
