//! Source file access.
//!
//! - `sources` — typed readers for the five datasets.
//! - `raw` — untyped rows for the archive mirror.
//! - `download` — fetching the datasets from their published URLs.

pub mod download;
pub mod raw;
pub mod sources;
