//! Relational store abstraction.
//!
//! The writer talks to a `Store`: something that can upsert one batch of
//! rows atomically and read back surrogate ids. `pg::PgStore` is the
//! production implementation; `memory::MemoryStore` backs the tests.
//!
//! Submodules:
//! - `pg` — blocking `postgres` client, one transaction per batch.
//! - `memory` — in-process tables with the same upsert semantics.

pub mod memory;
pub mod pg;

use crate::config::{RetryPolicy, StoreRole};
use crate::logging;
use crate::model::StoreError;
use chrono::NaiveDate;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Column type family, derived from the declared DDL type. Decides which
/// Rust type a raw value is bound as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Text,
    Date,
    Boolean,
    Unsupported(String),
}

impl SqlType {
    pub fn from_declared(declared: &str) -> Self {
        match declared.to_ascii_uppercase().as_str() {
            "SMALLINT" | "INT2" | "SMALLSERIAL" => SqlType::SmallInt,
            "INT" | "INTEGER" | "INT4" | "SERIAL" => SqlType::Integer,
            "BIGINT" | "INT8" | "BIGSERIAL" => SqlType::BigInt,
            "REAL" | "FLOAT4" => SqlType::Real,
            "DOUBLE PRECISION" | "DOUBLE" | "FLOAT" | "FLOAT8" => SqlType::Double,
            "" | "TEXT" | "VARCHAR" | "CHAR" | "CHARACTER" | "CHARACTER VARYING" | "NAME" => {
                SqlType::Text
            }
            "DATE" => SqlType::Date,
            "BOOLEAN" | "BOOL" => SqlType::Boolean,
            other => SqlType::Unsupported(other.to_string()),
        }
    }

    /// Converts one raw CSV field. Empty fields become NULL; anything that
    /// does not parse as this type is `None` so the caller can report it.
    pub fn parse_raw(&self, raw: &str) -> Option<SqlValue> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Some(self.null());
        }
        match self {
            SqlType::SmallInt => parse_integral(raw)
                .and_then(|v| i16::try_from(v).ok())
                .map(|v| SqlValue::SmallInt(Some(v))),
            SqlType::Integer => parse_integral(raw)
                .and_then(|v| i32::try_from(v).ok())
                .map(|v| SqlValue::Int(Some(v))),
            SqlType::BigInt => parse_integral(raw).map(|v| SqlValue::BigInt(Some(v))),
            SqlType::Real => raw.parse::<f32>().ok().map(|v| SqlValue::Real(Some(v))),
            SqlType::Double => raw.parse::<f64>().ok().map(|v| SqlValue::Double(Some(v))),
            SqlType::Text => Some(SqlValue::Text(Some(raw.to_string()))),
            SqlType::Date => crate::ingest::sources::parse_date(raw).map(|d| SqlValue::Date(Some(d))),
            SqlType::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" => Some(SqlValue::Bool(Some(true))),
                "false" | "f" | "0" | "no" => Some(SqlValue::Bool(Some(false))),
                _ => None,
            },
            SqlType::Unsupported(_) => None,
        }
    }

    fn null(&self) -> SqlValue {
        match self {
            SqlType::SmallInt => SqlValue::SmallInt(None),
            SqlType::Integer => SqlValue::Int(None),
            SqlType::BigInt => SqlValue::BigInt(None),
            SqlType::Real => SqlValue::Real(None),
            SqlType::Double => SqlValue::Double(None),
            SqlType::Date => SqlValue::Date(None),
            SqlType::Boolean => SqlValue::Bool(None),
            SqlType::Text | SqlType::Unsupported(_) => SqlValue::Text(None),
        }
    }
}

/// Integers in the sources are often written as floats ("1234.0").
fn parse_integral(raw: &str) -> Option<i64> {
    if let Ok(v) = raw.parse::<i64>() {
        return Some(v);
    }
    let v = raw.parse::<f64>().ok()?;
    if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

/// A typed, nullable column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    SmallInt(Option<i16>),
    Int(Option<i32>),
    BigInt(Option<i64>),
    Real(Option<f32>),
    Double(Option<f64>),
    Text(Option<String>),
    Date(Option<NaiveDate>),
    Bool(Option<bool>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        match self {
            SqlValue::SmallInt(v) => v.is_none(),
            SqlValue::Int(v) => v.is_none(),
            SqlValue::BigInt(v) => v.is_none(),
            SqlValue::Real(v) => v.is_none(),
            SqlValue::Double(v) => v.is_none(),
            SqlValue::Text(v) => v.is_none(),
            SqlValue::Date(v) => v.is_none(),
            SqlValue::Bool(v) => v.is_none(),
        }
    }

    /// Key form used to match natural keys and read back ids.
    pub fn key_text(&self) -> String {
        match self {
            SqlValue::SmallInt(Some(v)) => v.to_string(),
            SqlValue::Int(Some(v)) => v.to_string(),
            SqlValue::BigInt(Some(v)) => v.to_string(),
            SqlValue::Real(Some(v)) => v.to_string(),
            SqlValue::Double(Some(v)) => v.to_string(),
            SqlValue::Text(Some(v)) => v.clone(),
            SqlValue::Date(Some(v)) => v.to_string(),
            SqlValue::Bool(Some(v)) => v.to_string(),
            _ => String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

/// What to do when a row collides with an existing natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    /// Overwrite every non-key column with the new value.
    Overwrite,
    /// Keep the existing row (insert-if-absent).
    Ignore,
}

/// An upsert against one table with a fixed column list.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertStatement {
    pub table: String,
    pub columns: Vec<String>,
    /// Natural key; always a subset of `columns`.
    pub key_columns: Vec<String>,
    pub on_conflict: ConflictAction,
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl UpsertStatement {
    /// Columns rewritten on conflict.
    pub fn update_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !self.key_columns.iter().any(|k| k.eq_ignore_ascii_case(c)))
            .map(|c| c.as_str())
            .collect()
    }

    /// PostgreSQL text of the statement, with `$n` placeholders.
    pub fn to_sql(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        let placeholders: Vec<String> = (1..=self.columns.len()).map(|i| format!("${}", i)).collect();
        let keys: Vec<String> = self.key_columns.iter().map(|c| quote_ident(c)).collect();

        let updates = self.update_columns();
        let action = if self.on_conflict == ConflictAction::Ignore || updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let sets: Vec<String> = updates
                .iter()
                .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
                .collect();
            format!("DO UPDATE SET {}", sets.join(", "))
        };

        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
            quote_ident(&self.table),
            columns.join(", "),
            placeholders.join(", "),
            keys.join(", "),
            action
        )
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

pub trait Store {
    /// Short name used in logs ("archive", "warehouse").
    fn label(&self) -> &str;

    /// Upserts `rows` (each in `statement.columns` order) as one unit: either
    /// every row is applied or none is. Returns rows inserted or updated.
    fn write_batch(
        &mut self,
        statement: &UpsertStatement,
        rows: &[Vec<SqlValue>],
    ) -> Result<u64, StoreError>;

    /// Maps the text form of `key_column` to the surrogate `id` of every row.
    fn key_ids(&mut self, table: &str, key_column: &str) -> Result<HashMap<String, i32>, StoreError>;
}

/// Calls `connect` up to `policy.attempts` times, sleeping `policy.delay()`
/// between attempts. The last error is reported once retries run out.
pub fn connect_with_retry<S, F>(
    role: StoreRole,
    policy: &RetryPolicy,
    mut connect: F,
) -> Result<S, StoreError>
where
    F: FnMut() -> Result<S, StoreError>,
{
    let target = role.label();
    let source = role.log_source();
    let attempts = policy.attempts.max(1);
    let mut last_message = String::new();

    for attempt in 1..=attempts {
        match connect() {
            Ok(store) => {
                if attempt > 1 {
                    tracing::info!(source = %source, store = target, attempt, "connected after retry");
                } else {
                    tracing::debug!(source = %source, store = target, "connected");
                }
                return Ok(store);
            }
            Err(err) => {
                last_message = match err {
                    StoreError::Connection { message, .. } => message,
                    other => other.to_string(),
                };
                logging::log_connection_attempt(source, target, attempt, attempts, &last_message);
                if attempt < attempts && !policy.delay().is_zero() {
                    std::thread::sleep(policy.delay());
                }
            }
        }
    }

    Err(StoreError::Connection {
        target: target.to_string(),
        attempts,
        message: last_message,
    })
}
