/// PostgreSQL store.
///
/// Holds one blocking `postgres::Client` for the whole run. Each batch runs
/// in its own transaction through a prepared statement; an error anywhere in
/// the batch drops the transaction, which rolls it back.

use crate::config::StoreSettings;
use crate::model::StoreError;
use crate::store::{quote_ident, SqlValue, Store, UpsertStatement};
use postgres::types::ToSql;
use postgres::{Client, NoTls};
use std::collections::HashMap;

pub struct PgStore {
    client: Client,
    label: String,
}

impl PgStore {
    /// Opens one connection. Retrying is the caller's business
    /// (`store::connect_with_retry`).
    pub fn connect(label: &str, settings: &StoreSettings) -> Result<Self, StoreError> {
        let mut config = postgres::Config::new();
        config
            .host(&settings.host)
            .port(settings.port)
            .user(&settings.user)
            .dbname(&settings.database);
        if !settings.password.is_empty() {
            config.password(&settings.password);
        }

        let client = config.connect(NoTls).map_err(|e| StoreError::Connection {
            target: settings.describe(),
            attempts: 1,
            message: describe_error(&e),
        })?;

        Ok(Self {
            client,
            label: label.to_string(),
        })
    }

    /// Opens a connection from a `postgres://` URL (used with `DATABASE_URL`).
    pub fn connect_url(label: &str, url: &str) -> Result<Self, StoreError> {
        let client = Client::connect(url, NoTls).map_err(|e| StoreError::Connection {
            target: label.to_string(),
            attempts: 1,
            message: describe_error(&e),
        })?;
        Ok(Self {
            client,
            label: label.to_string(),
        })
    }

    /// Runs a script of DDL statements, e.g. `sql/warehouse.sql`.
    pub fn execute_script(&mut self, script: &str) -> Result<(), StoreError> {
        self.client
            .batch_execute(script)
            .map_err(|e| StoreError::Statement {
                table: "<script>".to_string(),
                message: describe_error(&e),
            })
    }

    /// Row count of `table`, for reporting and tests.
    pub fn count(&mut self, table: &str) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let row = self
            .client
            .query_one(sql.as_str(), &[])
            .map_err(|e| query_error(table, &e))?;
        row.try_get(0).map_err(|e| query_error(table, &e))
    }
}

/// Database errors carry the server's message; the plain `Display` of
/// `postgres::Error` only says "db error".
fn describe_error(err: &postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => match db.detail() {
            Some(detail) => format!("{} ({})", db.message(), detail),
            None => db.message().to_string(),
        },
        None => err.to_string(),
    }
}

fn query_error(table: &str, err: &postgres::Error) -> StoreError {
    StoreError::Query {
        table: table.to_string(),
        message: describe_error(err),
    }
}

fn as_sql(value: &SqlValue) -> &(dyn ToSql + Sync) {
    match value {
        SqlValue::SmallInt(v) => v,
        SqlValue::Int(v) => v,
        SqlValue::BigInt(v) => v,
        SqlValue::Real(v) => v,
        SqlValue::Double(v) => v,
        SqlValue::Text(v) => v,
        SqlValue::Date(v) => v,
        SqlValue::Bool(v) => v,
    }
}

impl Store for PgStore {
    fn label(&self) -> &str {
        &self.label
    }

    fn write_batch(
        &mut self,
        statement: &UpsertStatement,
        rows: &[Vec<SqlValue>],
    ) -> Result<u64, StoreError> {
        let sql = statement.to_sql();
        let statement_error = |e: postgres::Error| StoreError::Statement {
            table: statement.table.clone(),
            message: describe_error(&e),
        };

        let mut tx = self.client.transaction().map_err(statement_error)?;
        let prepared = tx.prepare(&sql).map_err(statement_error)?;

        let mut written = 0;
        for row in rows {
            let params: Vec<&(dyn ToSql + Sync)> = row.iter().map(as_sql).collect();
            written += tx.execute(&prepared, &params).map_err(statement_error)?;
        }
        tx.commit().map_err(statement_error)?;

        Ok(written)
    }

    fn key_ids(&mut self, table: &str, key_column: &str) -> Result<HashMap<String, i32>, StoreError> {
        let sql = format!(
            "SELECT id, {}::text FROM {}",
            quote_ident(key_column),
            quote_ident(table)
        );
        let rows = self
            .client
            .query(sql.as_str(), &[])
            .map_err(|e| query_error(table, &e))?;

        let mut ids = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: i32 = row.try_get(0).map_err(|e| query_error(table, &e))?;
            let key: Option<String> = row.try_get(1).map_err(|e| query_error(table, &e))?;
            if let Some(key) = key {
                ids.insert(key, id);
            }
        }
        Ok(ids)
    }
}
