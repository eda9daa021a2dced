//! Run configuration.
//!
//! Everything a run needs comes from one TOML file (default `./etl.toml`)
//! plus a few environment overrides for connection secrets, read after
//! `dotenv` has loaded `.env`. See `etl.toml` at the repository root for a
//! complete example.

use crate::logging::DataSource;
use crate::model::ConfigError;
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 10;

/// Default first day of the interpolated population series: the first day
/// of the earliest complete dataset (2020).
pub fn default_interpolation_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or(NaiveDate::MIN)
}

// ---------------------------------------------------------------------------
// Store connection settings
// ---------------------------------------------------------------------------

/// Which of the two databases a connection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    Archive,
    Warehouse,
}

impl StoreRole {
    pub fn label(self) -> &'static str {
        match self {
            StoreRole::Archive => "archive",
            StoreRole::Warehouse => "warehouse",
        }
    }

    /// Tag carried by log events about this store.
    pub fn log_source(self) -> DataSource {
        match self {
            StoreRole::Archive => DataSource::Archive,
            StoreRole::Warehouse => DataSource::Warehouse,
        }
    }

    fn env_prefix(self) -> &'static str {
        match self {
            StoreRole::Archive => "ARCHIVE_DB",
            StoreRole::Warehouse => "WAREHOUSE_DB",
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct StoreSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
}

fn default_port() -> u16 {
    5432
}

impl StoreSettings {
    /// `user@host:port/database`, safe to log.
    pub fn describe(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

// Keep the password out of logs and panics.
impl std::fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Retry policy and validation mode
// ---------------------------------------------------------------------------

/// Bounded retry with a fixed delay, applied to connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
}

fn default_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_delay_secs() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay_secs: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

/// What to do when a source names a country with no canonical location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Report unmatched names and continue; their rows are skipped.
    #[default]
    Warn,
    /// Abort before any write if a vaccination or case source has unmatched names.
    Strict,
}

// ---------------------------------------------------------------------------
// Sources and schema files
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Archive table mirroring this file.
    pub archive_table: String,
    /// Where `fetch` downloads the file from, if anywhere.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcePaths {
    pub countries: SourceFile,
    pub population: SourceFile,
    pub vaccinations: SourceFile,
    pub covid: SourceFile,
    pub monkeypox: SourceFile,
}

impl SourcePaths {
    /// All five sources, in archive order.
    pub fn all(&self) -> [&SourceFile; 5] {
        [
            &self.countries,
            &self.population,
            &self.vaccinations,
            &self.covid,
            &self.monkeypox,
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaPaths {
    #[serde(default = "default_archive_ddl")]
    pub archive: PathBuf,
    #[serde(default = "default_warehouse_ddl")]
    pub warehouse: PathBuf,
}

fn default_archive_ddl() -> PathBuf {
    PathBuf::from("sql/archive.sql")
}

fn default_warehouse_ddl() -> PathBuf {
    PathBuf::from("sql/warehouse.sql")
}

impl Default for SchemaPaths {
    fn default() -> Self {
        Self {
            archive: default_archive_ddl(),
            warehouse: default_warehouse_ddl(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct EtlConfig {
    pub archive: StoreSettings,
    pub warehouse: StoreSettings,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub validation: ValidationMode,
    /// Interpolation worker threads; 0 uses every available core.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_interpolation_start")]
    pub interpolation_start: NaiveDate,
    pub sources: SourcePaths,
    #[serde(default)]
    pub schema: SchemaPaths,
    /// Alias artifact; the built-in table is used when absent.
    #[serde(default)]
    pub aliases_path: Option<PathBuf>,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl EtlConfig {
    /// Loads `.env`, parses `path`, applies environment overrides and validates.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: EtlConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overrides host and password of both stores from
    /// `{ARCHIVE,WAREHOUSE}_DB_{HOST,PASSWORD}`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for role in [StoreRole::Archive, StoreRole::Warehouse] {
            let prefix = role.env_prefix();
            let settings = match role {
                StoreRole::Archive => &mut self.archive,
                StoreRole::Warehouse => &mut self.warehouse,
            };
            if let Some(host) = lookup(&format!("{}_HOST", prefix)) {
                settings.host = host;
            }
            if let Some(password) = lookup(&format!("{}_PASSWORD", prefix)) {
                settings.password = password;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".to_string()));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.attempts must be at least 1".to_string(),
            ));
        }
        let tables: Vec<&str> = self
            .sources
            .all()
            .iter()
            .map(|s| s.archive_table.as_str())
            .collect();
        for (i, table) in tables.iter().enumerate() {
            if table.trim().is_empty() {
                return Err(ConfigError::Invalid("archive_table must not be empty".to_string()));
            }
            if tables[..i].iter().any(|t| t.eq_ignore_ascii_case(table)) {
                return Err(ConfigError::Invalid(format!(
                    "archive table '{}' is used by two sources",
                    table
                )));
            }
        }
        Ok(())
    }

    pub fn store(&self, role: StoreRole) -> &StoreSettings {
        match role {
            StoreRole::Archive => &self.archive,
            StoreRole::Warehouse => &self.warehouse,
        }
    }

    /// Number of interpolation workers to spawn (at least 1).
    pub fn resolved_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
