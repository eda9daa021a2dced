/// Schema-filtered, batched upserts into a `Store`.
///
/// Before a stream is written its columns are matched against the
/// `SchemaCatalog`: columns the table does not declare are dropped, and a
/// table that is unknown, shares no column with the stream, or lacks a
/// conflict-key column is skipped with a warning. Surviving rows are sent
/// in batches of `batch_size`; each batch is one transaction, and the first
/// failing batch stops the writer with `StoreError::BatchFailed`.

use crate::ingest::raw::RawTable;
use crate::logging::{self, DataSource};
use crate::model::{CaseReport, Disease, Location, LocationMetric, SchemaError, StoreError};
use crate::schema::SchemaCatalog;
use crate::store::{ConflictAction, SqlType, SqlValue, Store, UpsertStatement};
use std::collections::HashMap;
use tracing::warn;

/// Key column of every archive table.
pub const SOURCE_ROW_COLUMN: &str = "source_row";

// ---------------------------------------------------------------------------
// Record mapping
// ---------------------------------------------------------------------------

/// A warehouse record type and the table it is written to.
pub trait TableRecord {
    const TABLE: &'static str;
    /// All columns the record can supply, in `values()` order.
    const COLUMNS: &'static [&'static str];
    /// Natural key of the table.
    const KEY_COLUMNS: &'static [&'static str];
    const ON_CONFLICT: ConflictAction = ConflictAction::Overwrite;

    fn values(&self) -> Vec<SqlValue>;
}

impl TableRecord for Location {
    const TABLE: &'static str = "location";
    const COLUMNS: &'static [&'static str] = &["country", "continent"];
    const KEY_COLUMNS: &'static [&'static str] = &["country"];
    const ON_CONFLICT: ConflictAction = ConflictAction::Ignore;

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(Some(self.country.clone())),
            SqlValue::Text(Some(self.continent.clone())),
        ]
    }
}

impl TableRecord for LocationMetric {
    const TABLE: &'static str = "location_metric";
    const COLUMNS: &'static [&'static str] = &["location_ref", "inhabitants", "vaccination_rate", "date"];
    const KEY_COLUMNS: &'static [&'static str] = &["location_ref", "date"];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Int(Some(self.location_ref)),
            SqlValue::Double(self.inhabitants),
            SqlValue::Double(self.vaccination_rate),
            SqlValue::Date(Some(self.date)),
        ]
    }
}

impl TableRecord for Disease {
    const TABLE: &'static str = "disease";
    const COLUMNS: &'static [&'static str] = &["name"];
    const KEY_COLUMNS: &'static [&'static str] = &["name"];
    const ON_CONFLICT: ConflictAction = ConflictAction::Ignore;

    fn values(&self) -> Vec<SqlValue> {
        vec![SqlValue::Text(Some(self.name().to_string()))]
    }
}

impl TableRecord for CaseReport {
    const TABLE: &'static str = "case_report";
    const COLUMNS: &'static [&'static str] = &[
        "location_ref",
        "disease_ref",
        "total_confirmed",
        "total_death",
        "total_active",
        "date",
    ];
    const KEY_COLUMNS: &'static [&'static str] = &["location_ref", "disease_ref", "date"];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Int(Some(self.location_ref)),
            SqlValue::Int(Some(self.disease_ref)),
            SqlValue::BigInt(Some(self.total_confirmed)),
            SqlValue::BigInt(Some(self.total_death)),
            SqlValue::BigInt(self.total_active),
            SqlValue::Date(Some(self.date)),
        ]
    }
}

// ---------------------------------------------------------------------------
// Column planning
// ---------------------------------------------------------------------------

/// How a stream's columns map onto its table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnPlan {
    pub statement: UpsertStatement,
    /// Position in the stream of each statement column.
    pub indices: Vec<usize>,
    /// Declared type of each statement column.
    pub types: Vec<SqlType>,
    /// Stream columns the table does not declare.
    pub dropped_columns: Vec<String>,
}

/// Matches `columns` against the catalog entry for `table`.
pub fn plan_columns(
    catalog: &SchemaCatalog,
    table: &str,
    columns: &[&str],
    key_columns: &[&str],
    on_conflict: ConflictAction,
) -> Result<ColumnPlan, SchemaError> {
    let def = catalog
        .table(table)
        .ok_or_else(|| SchemaError::TableNotFound(table.to_string()))?;

    let mut names = Vec::new();
    let mut indices = Vec::new();
    let mut types = Vec::new();
    let mut dropped_columns = Vec::new();
    for (i, column) in columns.iter().enumerate() {
        match def.column(column) {
            Some(col) if !names.contains(&col.name) => {
                names.push(col.name.clone());
                indices.push(i);
                types.push(SqlType::from_declared(&col.sql_type));
            }
            _ => dropped_columns.push(column.to_string()),
        }
    }

    if names.is_empty() {
        return Err(SchemaError::NoColumnOverlap {
            table: def.name.clone(),
        });
    }

    let mut keys = Vec::with_capacity(key_columns.len());
    for key in key_columns {
        match names.iter().find(|n| n.eq_ignore_ascii_case(key)) {
            Some(name) => keys.push(name.clone()),
            None => {
                return Err(SchemaError::MissingKeyColumn {
                    table: def.name.clone(),
                    column: key.to_string(),
                });
            }
        }
    }

    Ok(ColumnPlan {
        statement: UpsertStatement {
            table: def.name.clone(),
            columns: names,
            key_columns: keys,
            on_conflict,
        },
        indices,
        types,
        dropped_columns,
    })
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatus {
    Written,
    Skipped(SchemaError),
}

/// Outcome of writing one stream to one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableWriteReport {
    pub table: String,
    pub attempted: usize,
    /// Rows inserted or updated, as reported by the store.
    pub written: u64,
    /// Rows not sent because the table was skipped.
    pub skipped: usize,
    pub status: WriteStatus,
    pub dropped_columns: Vec<String>,
}

impl TableWriteReport {
    fn not_written(table: &str, attempted: usize, reason: SchemaError) -> Self {
        Self {
            table: table.to_string(),
            attempted,
            written: 0,
            skipped: attempted,
            status: WriteStatus::Skipped(reason),
            dropped_columns: Vec::new(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, WriteStatus::Skipped(_))
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Owns one store for the length of a run.
pub struct WarehouseWriter<'a, S: Store> {
    store: S,
    catalog: &'a SchemaCatalog,
    batch_size: usize,
}

impl<'a, S: Store> WarehouseWriter<'a, S> {
    pub fn new(store: S, catalog: &'a SchemaCatalog, batch_size: usize) -> Self {
        Self {
            store,
            catalog,
            batch_size: batch_size.max(1),
        }
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Surrogate ids of `table` keyed by the text of `key_column`.
    pub fn key_ids(&mut self, table: &str, key_column: &str) -> Result<HashMap<String, i32>, StoreError> {
        self.store.key_ids(table, key_column)
    }

    /// Upserts `records` into `R::TABLE`.
    pub fn write_records<R: TableRecord>(
        &mut self,
        source: DataSource,
        records: &[R],
    ) -> Result<TableWriteReport, StoreError> {
        let plan = match plan_columns(self.catalog, R::TABLE, R::COLUMNS, R::KEY_COLUMNS, R::ON_CONFLICT) {
            Ok(plan) => plan,
            Err(reason) => return Ok(self.skip(source, R::TABLE, records.len(), reason)),
        };

        let batches = records.chunks(self.batch_size).map(|chunk| {
            let rows: Vec<Vec<SqlValue>> = chunk
                .iter()
                .map(|record| {
                    let values = record.values();
                    plan.indices.iter().map(|&i| values[i].clone()).collect()
                })
                .collect();
            Ok(rows)
        });
        let written = self.write_batches(source, &plan.statement, batches)?;
        Ok(self.finish(source, plan, records.len(), written))
    }

    /// Mirrors a raw source file into archive table `table`, keyed by
    /// `source_row`. Values are bound with the types the catalog declares.
    pub fn write_raw(
        &mut self,
        source: DataSource,
        table: &str,
        raw: &RawTable,
    ) -> Result<TableWriteReport, StoreError> {
        let mut columns: Vec<&str> = vec![SOURCE_ROW_COLUMN];
        columns.extend(raw.headers.iter().map(String::as_str));

        let plan = match plan_columns(
            self.catalog,
            table,
            &columns,
            &[SOURCE_ROW_COLUMN],
            ConflictAction::Overwrite,
        ) {
            Ok(plan) => plan,
            Err(reason) => return Ok(self.skip(source, table, raw.rows.len(), reason)),
        };

        let batches = raw.rows.chunks(self.batch_size).map(|chunk| {
            chunk
                .iter()
                .map(|record| {
                    plan.indices
                        .iter()
                        .zip(&plan.types)
                        .zip(&plan.statement.columns)
                        .map(|((&i, sql_type), column)| {
                            let text = match i {
                                0 => record.source_row.to_string(),
                                _ => record.values.get(i - 1).cloned().unwrap_or_default(),
                            };
                            sql_type.parse_raw(&text).ok_or_else(|| StoreError::Conversion {
                                table: plan.statement.table.clone(),
                                column: column.clone(),
                                sql_type: format!("{:?}", sql_type),
                                value: text,
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()
                })
                .collect::<Result<Vec<_>, _>>()
        });
        let written = self.write_batches(source, &plan.statement, batches)?;
        Ok(self.finish(source, plan, raw.rows.len(), written))
    }

    fn skip(&self, source: DataSource, table: &str, attempted: usize, reason: SchemaError) -> TableWriteReport {
        warn!(source = %source, table, "table skipped, {} row(s) not written: {}", attempted, reason);
        TableWriteReport::not_written(table, attempted, reason)
    }

    fn finish(&self, source: DataSource, plan: ColumnPlan, attempted: usize, written: u64) -> TableWriteReport {
        if !plan.dropped_columns.is_empty() {
            warn!(
                source = %source,
                table = %plan.statement.table,
                "columns not in schema were not written: {}",
                plan.dropped_columns.join(", ")
            );
        }
        logging::log_table_summary(source, &plan.statement.table, attempted, written);
        TableWriteReport {
            table: plan.statement.table,
            attempted,
            written,
            skipped: 0,
            status: WriteStatus::Written,
            dropped_columns: plan.dropped_columns,
        }
    }

    fn write_batches<I>(
        &mut self,
        source: DataSource,
        statement: &UpsertStatement,
        batches: I,
    ) -> Result<u64, StoreError>
    where
        I: Iterator<Item = Result<Vec<Vec<SqlValue>>, StoreError>>,
    {
        let mut committed = 0;
        for (i, batch) in batches.enumerate() {
            let number = i + 1;
            let result = batch.and_then(|rows| self.store.write_batch(statement, &rows));
            match result {
                Ok(written) => committed += written,
                Err(e) => {
                    logging::log_write_failure(source, &statement.table, number, &e.to_string());
                    return Err(StoreError::BatchFailed {
                        table: statement.table.clone(),
                        batch: number,
                        committed,
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawArchiveRecord;
    use crate::store::memory::MemoryStore;
    use chrono::NaiveDate;

    const WAREHOUSE_DDL: &str = r#"
        CREATE TABLE location (
            id SERIAL PRIMARY KEY,
            country TEXT NOT NULL UNIQUE
        );
        CREATE TABLE disease (
            id SERIAL PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );
        CREATE TABLE location_metric (
            id SERIAL,
            PRIMARY KEY (id)
        );
        CREATE TABLE case_report (
            id SERIAL PRIMARY KEY,
            location_ref INTEGER,
            total_confirmed BIGINT,
            date DATE
        );
        CREATE TABLE vaccinations (
            source_row BIGINT PRIMARY KEY,
            location TEXT,
            people_vaccinated DOUBLE PRECISION
        );
    "#;

    fn location(country: &str) -> Location {
        Location {
            country: country.to_string(),
            continent: "Asia".to_string(),
        }
    }

    #[test]
    fn test_columns_absent_from_schema_are_never_written() {
        let catalog = SchemaCatalog::parse(WAREHOUSE_DDL);
        let store = MemoryStore::new("warehouse");
        let mut writer = WarehouseWriter::new(store.clone(), &catalog, 1000);

        let report = writer
            .write_records(DataSource::Countries, &[location("Viet Nam")])
            .unwrap();
        assert_eq!(report.dropped_columns, vec!["continent".to_string()]);

        let rows = store.rows("location");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].values.contains_key("country"));
        assert!(!rows[0].values.contains_key("continent"));
    }

    #[test]
    fn test_primary_key_only_table_is_skipped() {
        let catalog = SchemaCatalog::parse(WAREHOUSE_DDL);
        let store = MemoryStore::new("warehouse");
        let mut writer = WarehouseWriter::new(store.clone(), &catalog, 1000);
        let metric = LocationMetric {
            location_ref: 1,
            date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            inhabitants: Some(97.0),
            vaccination_rate: Some(0.0),
        };

        let report = writer.write_records(DataSource::Vaccinations, &[metric]).unwrap();
        assert!(report.is_skipped());
        assert_eq!(report.skipped, 1);
        assert_eq!(
            report.status,
            WriteStatus::Skipped(SchemaError::NoColumnOverlap {
                table: "location_metric".to_string()
            })
        );
        assert_eq!(store.row_count("location_metric"), 0);
    }

    #[test]
    fn test_missing_key_column_skips_table() {
        let catalog = SchemaCatalog::parse(WAREHOUSE_DDL);
        let mut writer = WarehouseWriter::new(MemoryStore::new("warehouse"), &catalog, 1000);
        let report = CaseReport {
            location_ref: 1,
            disease_ref: 1,
            date: NaiveDate::from_ymd_opt(2020, 3, 1).unwrap(),
            total_confirmed: 1,
            total_death: 0,
            total_active: None,
        };
        let result = writer.write_records(DataSource::Covid, &[report]).unwrap();
        assert_eq!(
            result.status,
            WriteStatus::Skipped(SchemaError::MissingKeyColumn {
                table: "case_report".to_string(),
                column: "disease_ref".to_string()
            })
        );
    }

    #[test]
    fn test_unknown_table_is_skipped_not_fatal() {
        let catalog = SchemaCatalog::parse("CREATE TABLE other (x INT);");
        let mut writer = WarehouseWriter::new(MemoryStore::new("warehouse"), &catalog, 10);
        let report = writer
            .write_records(DataSource::Countries, &[location("Peru")])
            .unwrap();
        assert_eq!(
            report.status,
            WriteStatus::Skipped(SchemaError::TableNotFound("location".to_string()))
        );
    }

    #[test]
    fn test_disease_insert_is_ignored_on_conflict() {
        let catalog = SchemaCatalog::parse(WAREHOUSE_DDL);
        let mut writer = WarehouseWriter::new(MemoryStore::new("warehouse"), &catalog, 10);
        let first = writer.write_records(DataSource::System, &Disease::ALL).unwrap();
        let second = writer.write_records(DataSource::System, &Disease::ALL).unwrap();
        assert_eq!(first.written, 2);
        assert_eq!(second.written, 0);

        let ids = writer.key_ids("disease", "name").unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains_key("Covid-19"));
    }

    #[test]
    fn test_existing_location_keeps_its_continent() {
        let catalog = SchemaCatalog::parse(
            "CREATE TABLE location (id SERIAL PRIMARY KEY, country TEXT NOT NULL UNIQUE, continent TEXT);",
        );
        let store = MemoryStore::new("warehouse");
        let mut writer = WarehouseWriter::new(store.clone(), &catalog, 10);

        let first = writer
            .write_records(DataSource::Countries, &[location("Viet Nam")])
            .unwrap();
        let ids = writer.key_ids("location", "country").unwrap();

        let moved = Location {
            country: "Viet Nam".to_string(),
            continent: "Oceania".to_string(),
        };
        let second = writer.write_records(DataSource::Countries, &[moved]).unwrap();
        assert_eq!(first.written, 1);
        assert_eq!(second.written, 0);

        let rows = store.rows("location");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, ids["Viet Nam"]);
        assert_eq!(
            rows[0].values.get("continent"),
            Some(&SqlValue::Text(Some("Asia".to_string())))
        );
    }

    #[test]
    fn test_rows_are_sent_in_batches() {
        let catalog = SchemaCatalog::parse(WAREHOUSE_DDL);
        let store = MemoryStore::new("warehouse");
        let mut writer = WarehouseWriter::new(store.clone(), &catalog, 2);
        let locations: Vec<Location> = (0..5).map(|i| location(&format!("Country {}", i))).collect();

        let report = writer.write_records(DataSource::Countries, &locations).unwrap();
        assert_eq!(report.attempted, 5);
        assert_eq!(report.written, 5);
        assert_eq!(store.row_count("location"), 5);
    }

    #[test]
    fn test_failing_batch_stops_writer_and_keeps_earlier_batches() {
        let catalog = SchemaCatalog::parse(WAREHOUSE_DDL);
        let store = MemoryStore::new("warehouse");
        store.add_check("location", "country", |v| v != &SqlValue::Text(Some("Country 3".to_string())));
        let mut writer = WarehouseWriter::new(store.clone(), &catalog, 2);
        let locations: Vec<Location> = (0..6).map(|i| location(&format!("Country {}", i))).collect();

        match writer.write_records(DataSource::Countries, &locations) {
            Err(StoreError::BatchFailed { batch, committed, .. }) => {
                assert_eq!(batch, 2);
                assert_eq!(committed, 2);
            }
            other => panic!("expected batch failure, got {:?}", other),
        }
        assert_eq!(store.row_count("location"), 2);
    }

    #[test]
    fn test_raw_rows_use_declared_types_and_source_row_key() {
        let catalog = SchemaCatalog::parse(WAREHOUSE_DDL);
        let store = MemoryStore::new("archive");
        let mut writer = WarehouseWriter::new(store.clone(), &catalog, 100);
        let raw = RawTable {
            headers: vec!["location".to_string(), "date".to_string(), "people_vaccinated".to_string()],
            rows: vec![
                RawArchiveRecord {
                    source_row: 1,
                    values: vec!["Vietnam".to_string(), "2021-01-01".to_string(), "97".to_string()],
                },
                RawArchiveRecord {
                    source_row: 2,
                    values: vec!["Vietnam".to_string(), "2021-01-02".to_string(), String::new()],
                },
            ],
            unreadable: 0,
        };

        let report = writer.write_raw(DataSource::Vaccinations, "vaccinations", &raw).unwrap();
        assert_eq!(report.dropped_columns, vec!["date".to_string()]);
        let rows = store.rows("vaccinations");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values["source_row"], SqlValue::BigInt(Some(1)));
        assert_eq!(rows[0].values["people_vaccinated"], SqlValue::Double(Some(97.0)));
        assert_eq!(rows[1].values["people_vaccinated"], SqlValue::Double(None));

        // Same file again: same keys, no new rows
        writer.write_raw(DataSource::Vaccinations, "vaccinations", &raw).unwrap();
        assert_eq!(store.row_count("vaccinations"), 2);
    }

    #[test]
    fn test_raw_value_of_wrong_type_fails_the_batch() {
        let catalog = SchemaCatalog::parse(WAREHOUSE_DDL);
        let mut writer = WarehouseWriter::new(MemoryStore::new("archive"), &catalog, 100);
        let raw = RawTable {
            headers: vec!["people_vaccinated".to_string()],
            rows: vec![RawArchiveRecord {
                source_row: 1,
                values: vec!["lots".to_string()],
            }],
            unreadable: 0,
        };
        let result = writer.write_raw(DataSource::Vaccinations, "vaccinations", &raw);
        match result {
            Err(StoreError::BatchFailed { source, .. }) => {
                assert!(matches!(*source, StoreError::Conversion { .. }));
            }
            other => panic!("expected conversion failure, got {:?}", other),
        }
    }
}
