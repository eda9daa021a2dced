use super::{ConflictAction, SqlValue, Store, UpsertStatement};
use crate::model::StoreError;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One stored row: surrogate id plus named values.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRow {
    pub id: i32,
    pub values: BTreeMap<String, SqlValue>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct MemoryTable {
    rows: Vec<MemoryRow>,
    next_id: i32,
}

/// A column check, standing in for a database CHECK/NOT NULL constraint.
#[derive(Clone)]
struct ColumnCheck {
    table: String,
    column: String,
    accepts: fn(&SqlValue) -> bool,
}

/// In-memory store for development and tests.
///
/// Handles are cheap clones sharing the same tables, so a test can keep one
/// handle while the pipeline owns (and drops) another, the way a database
/// outlives its connections.
#[derive(Clone)]
pub struct MemoryStore {
    label: String,
    tables: Arc<Mutex<HashMap<String, MemoryTable>>>,
    checks: Arc<Mutex<Vec<ColumnCheck>>>,
}

impl MemoryStore {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            tables: Arc::new(Mutex::new(HashMap::new())),
            checks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Rejects any batch containing a value of `table.column` for which
    /// `accepts` is false.
    pub fn add_check(&self, table: &str, column: &str, accepts: fn(&SqlValue) -> bool) {
        self.checks.lock().unwrap().push(ColumnCheck {
            table: table.to_ascii_lowercase(),
            column: column.to_ascii_lowercase(),
            accepts,
        });
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(&table.to_ascii_lowercase())
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    pub fn rows(&self, table: &str) -> Vec<MemoryRow> {
        self.tables
            .lock()
            .unwrap()
            .get(&table.to_ascii_lowercase())
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Every table's rows, keyed and ordered by table name.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<MemoryRow>> {
        self.tables
            .lock()
            .unwrap()
            .iter()
            .map(|(name, table)| (name.clone(), table.rows.clone()))
            .collect()
    }

    fn check_row(&self, statement: &UpsertStatement, row: &[SqlValue]) -> Result<(), StoreError> {
        let checks = self.checks.lock().unwrap();
        let table = statement.table.to_ascii_lowercase();
        for check in checks.iter().filter(|c| c.table == table) {
            let position = statement
                .columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(&check.column));
            if let Some(value) = position.and_then(|i| row.get(i)) {
                if !(check.accepts)(value) {
                    return Err(StoreError::Statement {
                        table: statement.table.clone(),
                        message: format!(
                            "new row violates check constraint on column \"{}\": {:?}",
                            check.column, value
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

fn upsert_row(table: &mut MemoryTable, statement: &UpsertStatement, row: &[SqlValue]) -> u64 {
    let values: BTreeMap<String, SqlValue> = statement
        .columns
        .iter()
        .map(|c| c.to_ascii_lowercase())
        .zip(row.iter().cloned())
        .collect();
    let keys: Vec<String> = statement
        .key_columns
        .iter()
        .map(|k| k.to_ascii_lowercase())
        .collect();

    let existing = table
        .rows
        .iter_mut()
        .find(|r| keys.iter().all(|k| r.values.get(k) == values.get(k)));

    match existing {
        Some(existing) => match statement.on_conflict {
            ConflictAction::Ignore => 0,
            ConflictAction::Overwrite => {
                if statement.update_columns().is_empty() {
                    return 0;
                }
                for (column, value) in values {
                    existing.values.insert(column, value);
                }
                1
            }
        },
        None => {
            table.next_id += 1;
            table.rows.push(MemoryRow {
                id: table.next_id,
                values,
            });
            1
        }
    }
}

impl Store for MemoryStore {
    fn label(&self) -> &str {
        &self.label
    }

    fn write_batch(
        &mut self,
        statement: &UpsertStatement,
        rows: &[Vec<SqlValue>],
    ) -> Result<u64, StoreError> {
        for row in rows {
            if row.len() != statement.columns.len() {
                return Err(StoreError::Statement {
                    table: statement.table.clone(),
                    message: format!(
                        "expected {} values, got {}",
                        statement.columns.len(),
                        row.len()
                    ),
                });
            }
            self.check_row(statement, row)?;
        }

        // Apply to a copy and swap it in only when every row succeeded.
        let mut tables = self.tables.lock().unwrap();
        let name = statement.table.to_ascii_lowercase();
        let mut table = tables.get(&name).cloned().unwrap_or_default();
        let written: u64 = rows
            .iter()
            .map(|row| upsert_row(&mut table, statement, row))
            .sum();
        tables.insert(name, table);

        debug!(store = %self.label, table = %statement.table, rows = rows.len(), written, "batch applied");
        Ok(written)
    }

    fn key_ids(&mut self, table: &str, key_column: &str) -> Result<HashMap<String, i32>, StoreError> {
        let key_column = key_column.to_ascii_lowercase();
        Ok(self
            .rows(table)
            .into_iter()
            .filter_map(|row| {
                let key = row.values.get(&key_column)?;
                (!key.is_null()).then(|| (key.key_text(), row.id))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location_statement() -> UpsertStatement {
        UpsertStatement {
            table: "location".to_string(),
            columns: vec!["country".to_string(), "continent".to_string()],
            key_columns: vec!["country".to_string()],
            on_conflict: ConflictAction::Overwrite,
        }
    }

    fn text(s: &str) -> SqlValue {
        SqlValue::Text(Some(s.to_string()))
    }

    #[test]
    fn test_upsert_overwrites_non_key_columns() {
        let mut store = MemoryStore::new("warehouse");
        let stmt = location_statement();
        store.write_batch(&stmt, &[vec![text("France"), text("Europa")]]).unwrap();
        store.write_batch(&stmt, &[vec![text("France"), text("Europe")]]).unwrap();

        let rows = store.rows("location");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 1);
        assert_eq!(rows[0].values["continent"], text("Europe"));
    }

    #[test]
    fn test_ignore_keeps_existing_row() {
        let mut store = MemoryStore::new("warehouse");
        let mut stmt = location_statement();
        stmt.on_conflict = ConflictAction::Ignore;
        store.write_batch(&stmt, &[vec![text("France"), text("Europe")]]).unwrap();
        let written = store.write_batch(&stmt, &[vec![text("France"), text("Asia")]]).unwrap();

        assert_eq!(written, 0);
        assert_eq!(store.rows("location")[0].values["continent"], text("Europe"));
    }

    #[test]
    fn test_failed_check_commits_nothing_from_the_batch() {
        let mut store = MemoryStore::new("warehouse");
        store.add_check("location", "continent", |v| v != &SqlValue::Text(Some("Atlantis".to_string())));
        let stmt = location_statement();
        let result = store.write_batch(
            &stmt,
            &[
                vec![text("France"), text("Europe")],
                vec![text("Nowhere"), text("Atlantis")],
            ],
        );

        assert!(result.is_err());
        assert_eq!(store.row_count("location"), 0);
    }

    #[test]
    fn test_clones_share_tables() {
        let observer = MemoryStore::new("warehouse");
        let mut writer = observer.clone();
        writer
            .write_batch(&location_statement(), &[vec![text("Peru"), text("South America")]])
            .unwrap();
        assert_eq!(observer.row_count("location"), 1);
    }

    #[test]
    fn test_key_ids_maps_keys_to_surrogate_ids() {
        let mut store = MemoryStore::new("warehouse");
        store
            .write_batch(
                &location_statement(),
                &[
                    vec![text("France"), text("Europe")],
                    vec![text("Peru"), text("South America")],
                ],
            )
            .unwrap();
        let ids = store.key_ids("location", "country").unwrap();
        assert_eq!(ids["France"], 1);
        assert_eq!(ids["Peru"], 2);
        assert!(store.key_ids("missing", "country").unwrap().is_empty());
    }
}
