//! Transform-and-load pipeline for an epidemiological warehouse.
//!
//! Raw country, population, vaccination and disease-report CSV files are
//! mirrored into an archive database, then reconciled, interpolated and
//! upserted into a normalized warehouse (`location`, `location_metric`,
//! `disease`, `case_report`).
//!
//! Modules, leaf-first:
//! - `model` — records, null policy, error types.
//! - `config` — `etl.toml` and environment overrides.
//! - `logging` — tracing setup and log helpers.
//! - `schema` — table/column catalog parsed from DDL.
//! - `countries` — country name reconciliation.
//! - `ingest` — CSV readers and dataset download.
//! - `analysis` — population interpolation and record joins.
//! - `store` — store trait with PostgreSQL and in-memory backends.
//! - `writer` — schema-filtered, batched upserts.
//! - `verify` — country coverage report.
//! - `pipeline` — run orchestration.

pub mod analysis;
pub mod config;
pub mod countries;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod schema;
pub mod store;
pub mod verify;
pub mod writer;
