//! Country coverage verification.
//!
//! Compares the distinct canonical country names of every source against
//! the canonical set of the countries/continents source, which is what the
//! `location` table will hold. Rows for an unmatched name are skipped by the
//! joins, so this report is where such silent losses become visible.
//!
//! Run it on its own with `epi_warehouse verify` after editing the alias
//! file or adding a source; the pipeline also runs it before any write.

use crate::config::{EtlConfig, ValidationMode};
use crate::countries::CountryAliases;
use crate::ingest::sources::{self, SourceBundle};
use crate::logging::DataSource;
use crate::model::{ConfigError, EtlError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Unmatched names listed in a strict-mode error before truncating.
const MAX_NAMES_IN_ERROR: usize = 20;

// ============================================================================
// Verification Results
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageReport {
    pub timestamp: String,
    pub alias_version: u32,
    pub location_count: usize,
    pub sources: Vec<SourceCoverage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCoverage {
    pub source: String,
    pub status: VerificationStatus,
    /// Distinct canonical country names in the source.
    pub total: usize,
    pub matched: usize,
    /// Sorted canonical names with no location.
    pub unmatched: Vec<String>,
    /// Whether unmatched names abort a strict run.
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum VerificationStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl CoverageReport {
    /// Unmatched names of the sources that strict mode enforces.
    pub fn strict_unmatched(&self) -> Vec<(&str, &str)> {
        self.sources
            .iter()
            .filter(|s| s.strict)
            .flat_map(|s| s.unmatched.iter().map(move |name| (s.source.as_str(), name.as_str())))
            .collect()
    }

    pub fn source(&self, source: DataSource) -> Option<&SourceCoverage> {
        let tag = source.to_string();
        self.sources.iter().find(|s| s.source == tag)
    }
}

// ============================================================================
// Coverage
// ============================================================================

fn canonical_set<'a, I>(names: I, aliases: &CountryAliases) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    names.into_iter().map(|n| aliases.normalize(n)).collect()
}

fn source_coverage(
    source: DataSource,
    names: BTreeSet<String>,
    locations: &BTreeSet<String>,
    strict: bool,
) -> SourceCoverage {
    let unmatched: Vec<String> = names.difference(locations).cloned().collect();
    let total = names.len();
    let matched = total - unmatched.len();

    let status = if total > 0 && unmatched.is_empty() {
        VerificationStatus::Success
    } else if matched > 0 {
        VerificationStatus::PartialSuccess
    } else {
        VerificationStatus::Failed
    };

    SourceCoverage {
        source: source.to_string(),
        status,
        total,
        matched,
        unmatched,
        strict,
    }
}

/// Builds the coverage report for already-loaded sources.
pub fn verify_coverage(bundle: &SourceBundle, aliases: &CountryAliases) -> CoverageReport {
    let locations = canonical_set(bundle.countries.rows.iter().map(|r| r.country.as_str()), aliases);

    let mut sources = vec![
        // Aggregate regions ("World", "Europe") live here; never enforced.
        source_coverage(
            DataSource::Population,
            canonical_set(bundle.population.rows.iter().map(|r| r.country.as_str()), aliases),
            &locations,
            false,
        ),
        source_coverage(
            DataSource::Vaccinations,
            canonical_set(bundle.vaccinations.rows.iter().map(|r| r.country.as_str()), aliases),
            &locations,
            true,
        ),
    ];
    for disease in crate::model::Disease::ALL {
        let rows = bundle.reports(disease);
        sources.push(source_coverage(
            sources::disease_source(disease),
            canonical_set(rows.rows.iter().map(|r| r.country.as_str()), aliases),
            &locations,
            true,
        ));
    }

    CoverageReport {
        timestamp: Utc::now().to_rfc3339(),
        alias_version: aliases.version(),
        location_count: locations.len(),
        sources,
    }
}

/// Logs unmatched names and, in strict mode, fails when an enforced source
/// has any.
pub fn enforce(report: &CoverageReport, mode: ValidationMode) -> Result<(), ConfigError> {
    for coverage in &report.sources {
        if coverage.unmatched.is_empty() {
            info!(source = %coverage.source, "all {} countries matched", coverage.total);
        } else {
            warn!(
                source = %coverage.source,
                "{}/{} countries have no location: {}",
                coverage.unmatched.len(),
                coverage.total,
                coverage.unmatched.join(", ")
            );
        }
    }

    if mode == ValidationMode::Warn {
        return Ok(());
    }
    let unmatched = report.strict_unmatched();
    if unmatched.is_empty() {
        return Ok(());
    }

    let mut names: Vec<String> = unmatched
        .iter()
        .take(MAX_NAMES_IN_ERROR)
        .map(|(source, name)| format!("{} ({})", name, source))
        .collect();
    if unmatched.len() > MAX_NAMES_IN_ERROR {
        names.push(format!("... {} more", unmatched.len() - MAX_NAMES_IN_ERROR));
    }
    Err(ConfigError::UnmappedCountries {
        count: unmatched.len(),
        names: names.join(", "),
    })
}

// ============================================================================
// Full Verification Runner
// ============================================================================

/// Loads aliases and sources from `config` and builds the report. Sources
/// that fail to load are reported as empty.
pub fn run_verification(config: &EtlConfig) -> Result<CoverageReport, EtlError> {
    let aliases = CountryAliases::load_or_builtin(config.aliases_path.as_deref())?;
    let bundle = sources::load_bundle(config);
    if let Some((_, err)) = bundle.errors.iter().find(|(s, _)| *s == DataSource::Countries) {
        warn!(source = %DataSource::Countries, "no locations to verify against: {}", err);
    }
    Ok(verify_coverage(&bundle, &aliases))
}

pub fn print_summary(report: &CoverageReport) {
    println!("\n{}", "=".repeat(60));
    println!("COUNTRY COVERAGE (alias table v{})", report.alias_version);
    println!("{}", "=".repeat(60));
    println!();
    println!("Locations: {}", report.location_count);
    println!();

    for coverage in &report.sources {
        let marker = match coverage.status {
            VerificationStatus::Success => "✓",
            VerificationStatus::PartialSuccess => "⚠",
            VerificationStatus::Failed => "✗",
        };
        println!(
            "{} {:<14} {}/{} matched",
            marker, coverage.source, coverage.matched, coverage.total
        );
        for name in &coverage.unmatched {
            println!("      - {}", name);
        }
    }
    println!("{}", "=".repeat(60));
}
