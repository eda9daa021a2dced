//! Builds warehouse records from source rows.
//!
//! Every join is total: rows that cannot be matched or fail the null policy
//! are skipped and counted in `JoinStats` by reason, never turned into
//! errors. Country names are normalized before any lookup.

use crate::analysis::population::PopulationSeries;
use crate::countries::CountryAliases;
use crate::ingest::sources::{CountryRow, DiseaseReportRow, SourceRows, VaccinationRow};
use crate::model::{
    CaseReport, DEFAULT_TOTAL_DEATH, Disease, Location, LocationMetric, MAX_VACCINATION_RATE,
    RATE_WITHOUT_POPULATION,
};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::collections::hash_map::Entry;

/// Per-join counts. `input` equals `kept` plus every skip counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinStats {
    pub input: usize,
    pub kept: usize,
    /// Rows the CSV reader could not parse.
    pub malformed: usize,
    /// Vaccination rows without a `people_vaccinated` figure.
    pub dropped: usize,
    pub skipped_no_location: usize,
    pub skipped_no_population: usize,
    pub skipped_missing_primary: usize,
    /// Negative or non-finite counts.
    pub skipped_invalid: usize,
    /// Earlier rows replaced by a later row with the same key.
    pub duplicates: usize,
}

impl JoinStats {
    fn from_input<T>(rows: &SourceRows<T>) -> Self {
        JoinStats {
            input: rows.input(),
            malformed: rows.malformed,
            ..Default::default()
        }
    }

    pub fn skipped(&self) -> usize {
        self.input.saturating_sub(self.kept)
    }
}

/// Last-write-wins collection keyed like the target table's upsert key.
struct KeyedRecords<K, T> {
    index: HashMap<K, usize>,
    records: Vec<T>,
}

impl<K: std::hash::Hash + Eq, T> KeyedRecords<K, T> {
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            records: Vec::new(),
        }
    }

    /// Returns true when an earlier record was replaced.
    fn put(&mut self, key: K, record: T) -> bool {
        match self.index.entry(key) {
            Entry::Occupied(slot) => {
                self.records[*slot.get()] = record;
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(self.records.len());
                self.records.push(record);
                false
            }
        }
    }

    fn into_records(self) -> Vec<T> {
        self.records
    }
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// One location per canonical country; the first occurrence wins.
pub fn build_locations(rows: &SourceRows<CountryRow>, aliases: &CountryAliases) -> (Vec<Location>, JoinStats) {
    let mut stats = JoinStats::from_input(rows);
    let mut seen = HashSet::new();
    let mut locations = Vec::new();

    for row in &rows.rows {
        let country = aliases.normalize(&row.country);
        if !seen.insert(country.clone()) {
            stats.duplicates += 1;
            continue;
        }
        locations.push(Location {
            country,
            continent: row.continent.trim().to_string(),
        });
    }

    stats.kept = locations.len();
    (locations, stats)
}

// ---------------------------------------------------------------------------
// LocationMetric
// ---------------------------------------------------------------------------

/// Share of the population vaccinated, in percent.
///
/// `inhabitants` is in millions. Without a population (unknown or 0) the
/// rate is `RATE_WITHOUT_POPULATION`; a result outside `[0, 100]` or not
/// finite is `None`.
pub fn vaccination_rate(people_vaccinated: f64, inhabitants: Option<f64>) -> Option<f64> {
    let inhabitants = match inhabitants {
        Some(v) if v > 0.0 => v,
        _ => return Some(RATE_WITHOUT_POPULATION),
    };
    let rate = people_vaccinated / (inhabitants * 1_000_000.0) * 100.0;
    if rate.is_finite() && (0.0..=MAX_VACCINATION_RATE).contains(&rate) {
        Some(rate)
    } else {
        None
    }
}

pub fn build_location_metrics(
    rows: &SourceRows<VaccinationRow>,
    aliases: &CountryAliases,
    location_ids: &HashMap<String, i32>,
    population: &PopulationSeries,
) -> (Vec<LocationMetric>, JoinStats) {
    let mut stats = JoinStats::from_input(rows);
    let mut metrics: KeyedRecords<(i32, NaiveDate), LocationMetric> = KeyedRecords::new();

    for row in &rows.rows {
        let Some(people_vaccinated) = row.people_vaccinated else {
            stats.dropped += 1;
            continue;
        };
        if !people_vaccinated.is_finite() || people_vaccinated < 0.0 {
            stats.skipped_invalid += 1;
            continue;
        }
        let country = aliases.normalize(&row.country);
        let Some(&location_ref) = location_ids.get(&country) else {
            stats.skipped_no_location += 1;
            continue;
        };
        let Some(inhabitants) = population.get(&country, row.date) else {
            stats.skipped_no_population += 1;
            continue;
        };

        let metric = LocationMetric {
            location_ref,
            date: row.date,
            inhabitants,
            vaccination_rate: vaccination_rate(people_vaccinated, inhabitants),
        };
        if metrics.put((location_ref, row.date), metric) {
            stats.duplicates += 1;
        }
    }

    let metrics = metrics.into_records();
    stats.kept = metrics.len();
    (metrics, stats)
}

// ---------------------------------------------------------------------------
// CaseReport
// ---------------------------------------------------------------------------

enum Count {
    Missing,
    Invalid,
    Valid(i64),
}

fn count(value: Option<f64>) -> Count {
    match value {
        None => Count::Missing,
        Some(v) if v.is_finite() && v >= 0.0 && v < i64::MAX as f64 => Count::Valid(v.round() as i64),
        Some(_) => Count::Invalid,
    }
}

/// Case reports of one disease source. `disease_ref` is the id of `disease`
/// in the warehouse.
pub fn build_case_reports(
    rows: &SourceRows<DiseaseReportRow>,
    disease: Disease,
    disease_ref: i32,
    aliases: &CountryAliases,
    location_ids: &HashMap<String, i32>,
) -> (Vec<CaseReport>, JoinStats) {
    let mut stats = JoinStats::from_input(rows);
    let mut reports: KeyedRecords<(i32, NaiveDate), CaseReport> = KeyedRecords::new();

    for row in &rows.rows {
        let country = aliases.normalize(&row.country);
        let Some(&location_ref) = location_ids.get(&country) else {
            stats.skipped_no_location += 1;
            continue;
        };
        let total_confirmed = match count(row.total_confirmed) {
            Count::Valid(v) => v,
            Count::Missing => {
                stats.skipped_missing_primary += 1;
                continue;
            }
            Count::Invalid => {
                stats.skipped_invalid += 1;
                continue;
            }
        };
        let total_death = match count(row.total_death) {
            Count::Valid(v) => v,
            Count::Missing => DEFAULT_TOTAL_DEATH,
            Count::Invalid => {
                stats.skipped_invalid += 1;
                continue;
            }
        };
        let total_active = match count(row.total_active) {
            Count::Valid(v) => Some(v),
            Count::Missing => None,
            Count::Invalid => {
                stats.skipped_invalid += 1;
                continue;
            }
        };

        let report = CaseReport {
            location_ref,
            disease_ref,
            date: row.date,
            total_confirmed,
            total_death,
            total_active,
        };
        if reports.put((location_ref, row.date), report) {
            stats.duplicates += 1;
        }
    }

    let reports = reports.into_records();
    stats.kept = reports.len();
    if disease.total_active_policy().is_approximation() && stats.kept > 0 {
        tracing::debug!(disease = %disease, "total_active approximated from daily new cases");
    }
    (reports, stats)
}
