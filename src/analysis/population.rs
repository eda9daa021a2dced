//! Daily population series from yearly samples.
//!
//! Each yearly sample is anchored at January 1 of its year. Every country is
//! reindexed onto the same calendar, from the configured start date through
//! December 31 of the latest year sampled anywhere in the table, and the days
//! between two anchors are filled by linear interpolation. Days before the
//! first or after the last anchor of a country stay null, as does every day
//! of a country with fewer than two samples.

use crate::countries::CountryAliases;
use crate::ingest::sources::PopulationTable;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Interpolated population (millions) per canonical country and day.
#[derive(Debug, Clone, PartialEq)]
pub struct PopulationSeries {
    start: NaiveDate,
    /// Last day of the series; before `start` when the series is empty.
    end: NaiveDate,
    by_country: HashMap<String, Vec<Option<f64>>>,
}

impl PopulationSeries {
    /// Population of `country` on `date`.
    ///
    /// `None` when the country is unknown or the date is outside the series;
    /// `Some(None)` when the day is in range but has no interpolated value.
    pub fn get(&self, country: &str, date: NaiveDate) -> Option<Option<f64>> {
        let values = self.by_country.get(country)?;
        if date < self.start || date > self.end {
            return None;
        }
        let offset = (date - self.start).num_days();
        values.get(usize::try_from(offset).ok()?).copied()
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of days in the series (the same for every country).
    pub fn days(&self) -> usize {
        day_count(self.start, self.end)
    }

    pub fn countries(&self) -> impl Iterator<Item = &str> {
        self.by_country.keys().map(String::as_str)
    }

    pub fn values(&self, country: &str) -> Option<&[Option<f64>]> {
        self.by_country.get(country).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.by_country.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_country.is_empty()
    }
}

fn day_count(start: NaiveDate, end: NaiveDate) -> usize {
    usize::try_from((end - start).num_days() + 1).unwrap_or(0)
}

fn anchor(year: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, 1, 1)
}

/// Interpolates one country's samples onto every day of `[start, end]`.
///
/// Values at anchor dates are the samples themselves, not a computed blend.
pub fn interpolate_country(samples: &[(i32, f64)], start: NaiveDate, end: NaiveDate) -> Vec<Option<f64>> {
    let days = day_count(start, end);
    let mut anchors: Vec<(NaiveDate, f64)> = samples
        .iter()
        .filter(|(_, v)| v.is_finite())
        .filter_map(|&(year, v)| anchor(year).map(|d| (d, v)))
        .collect();
    anchors.sort_by_key(|(d, _)| *d);
    anchors.dedup_by_key(|(d, _)| *d);

    let mut out = vec![None; days];
    if anchors.len() < 2 {
        return out;
    }

    let mut segment = 0;
    for (offset, slot) in out.iter_mut().enumerate() {
        let date = start + chrono::Duration::days(offset as i64);
        while segment + 1 < anchors.len() && anchors[segment + 1].0 < date {
            segment += 1;
        }
        let (d0, v0) = anchors[segment];
        if date < d0 {
            continue;
        }
        if date == d0 {
            *slot = Some(v0);
            continue;
        }
        let Some(&(d1, v1)) = anchors.get(segment + 1) else {
            // Past the last anchor.
            continue;
        };
        if date == d1 {
            *slot = Some(v1);
            continue;
        }
        let span = (d1 - d0).num_days() as f64;
        let elapsed = (date - d0).num_days() as f64;
        *slot = Some(v0 + (v1 - v0) * elapsed / span);
    }
    out
}

/// Builds the daily series for every country in `table`.
///
/// Country names are normalized first; when two rows normalize to the same
/// country the first one is used. Countries are split across `workers`
/// threads, each producing its own partition.
pub fn interpolate(
    table: &PopulationTable,
    aliases: &CountryAliases,
    start: NaiveDate,
    workers: usize,
) -> PopulationSeries {
    let end = table
        .max_sampled_year()
        .and_then(|year| NaiveDate::from_ymd_opt(year, 12, 31))
        .unwrap_or(start - chrono::Duration::days(1));

    let mut seen = HashSet::new();
    let mut countries: Vec<(String, &[(i32, f64)])> = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let name = aliases.normalize(&row.country);
        if !seen.insert(name.clone()) {
            debug!(country = %name, "duplicate population row ignored");
            continue;
        }
        countries.push((name, row.samples.as_slice()));
    }

    let workers = workers.clamp(1, countries.len().max(1));
    let chunk_size = countries.len().div_ceil(workers).max(1);

    let by_country = std::thread::scope(|scope| {
        let handles: Vec<_> = countries
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|(name, samples)| (name.clone(), interpolate_country(samples, start, end)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut merged = HashMap::with_capacity(countries.len());
        for handle in handles {
            match handle.join() {
                Ok(partition) => merged.extend(partition),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        merged
    });

    debug!(
        countries = countries.len(),
        workers,
        start = %start,
        end = %end,
        "population interpolated"
    );
    PopulationSeries { start, end, by_country }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::sources::PopulationRow;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn table(rows: &[(&str, &[(i32, f64)])]) -> PopulationTable {
        PopulationTable {
            years: vec![2020, 2021, 2022],
            rows: rows
                .iter()
                .map(|(country, samples)| PopulationRow {
                    country: country.to_string(),
                    samples: samples.to_vec(),
                })
                .collect(),
            malformed: 0,
        }
    }

    #[test]
    fn test_vietnam_interpolates_between_anchors() {
        let t = table(&[("Vietnam", &[(2020, 97.0), (2021, 98.0)])]);
        let series = interpolate(&t, &CountryAliases::builtin(), date(2020, 1, 1), 2);

        assert_eq!(series.get("Viet Nam", date(2020, 1, 1)), Some(Some(97.0)));
        assert_eq!(series.get("Viet Nam", date(2021, 1, 1)), Some(Some(98.0)));
        let june = series.get("Viet Nam", date(2020, 6, 1)).flatten().unwrap();
        assert!(june > 97.0 && june < 98.0, "June 1 2020 was {}", june);
        // After the last anchor the value is undefined but the day exists.
        assert_eq!(series.get("Viet Nam", date(2021, 6, 1)), Some(None));
        assert_eq!(series.get("Vietnam", date(2020, 6, 1)), None);
    }

    #[test]
    fn test_one_row_per_day_through_end_of_max_year() {
        let t = table(&[
            ("France", &[(2020, 67.0), (2022, 68.0)]),
            ("Peru", &[(2021, 33.0), (2022, 34.0)]),
        ]);
        let series = interpolate(&t, &CountryAliases::builtin(), date(2020, 1, 1), 4);

        // 2020 is a leap year: 366 + 365 + 365
        assert_eq!(series.days(), 1096);
        assert_eq!(series.end(), date(2022, 12, 31));
        for country in ["France", "Peru"] {
            assert_eq!(series.values(country).unwrap().len(), 1096);
        }
        assert_eq!(series.get("France", date(2023, 1, 1)), None);
        assert_eq!(series.get("Peru", date(2020, 6, 1)), Some(None));
        assert_eq!(series.get("Peru", date(2022, 1, 1)), Some(Some(34.0)));
    }

    #[test]
    fn test_single_sample_country_is_all_null_but_present() {
        let t = table(&[("Chile", &[(2021, 19.0)]), ("Peru", &[(2020, 33.0), (2021, 34.0)])]);
        let series = interpolate(&t, &CountryAliases::builtin(), date(2020, 1, 1), 1);

        let values = series.values("Chile").unwrap();
        assert_eq!(values.len(), series.days());
        assert!(values.iter().all(Option::is_none));
    }

    #[test]
    fn test_anchor_values_are_exact() {
        let samples = [(2020, 0.1), (2021, 0.7), (2022, 0.3)];
        let values = interpolate_country(&samples, date(2020, 1, 1), date(2022, 12, 31));
        assert_eq!(values[0], Some(0.1));
        assert_eq!(values[366], Some(0.7));
        assert_eq!(values[366 + 365], Some(0.3));
    }

    #[test]
    fn test_unsorted_samples_are_ordered_by_year() {
        let values = interpolate_country(&[(2021, 20.0), (2020, 10.0)], date(2020, 1, 1), date(2021, 1, 1));
        assert_eq!(values.first(), Some(&Some(10.0)));
        assert_eq!(values.last(), Some(&Some(20.0)));
        let mid = values[183].unwrap();
        assert!((mid - 15.0).abs() < 0.1, "mid-year was {}", mid);
    }

    #[test]
    fn test_start_after_first_anchor_keeps_interpolated_values() {
        let values = interpolate_country(&[(2019, 10.0), (2021, 30.0)], date(2020, 1, 1), date(2021, 12, 31));
        let first = values[0].unwrap();
        assert!(first > 10.0 && first < 30.0);
    }

    #[test]
    fn test_first_row_wins_when_names_collide() {
        let t = table(&[
            ("Vietnam", &[(2020, 97.0), (2021, 98.0)]),
            ("Viet Nam", &[(2020, 1.0), (2021, 2.0)]),
        ]);
        let series = interpolate(&t, &CountryAliases::builtin(), date(2020, 1, 1), 2);
        assert_eq!(series.len(), 1);
        assert_eq!(series.get("Viet Nam", date(2020, 1, 1)), Some(Some(97.0)));
    }

    #[test]
    fn test_worker_count_does_not_change_result() {
        let rows: Vec<(String, Vec<(i32, f64)>)> = (0..25)
            .map(|i| (format!("Country {}", i), vec![(2020, i as f64), (2021, i as f64 * 2.0)]))
            .collect();
        let borrowed: Vec<(&str, &[(i32, f64)])> =
            rows.iter().map(|(c, s)| (c.as_str(), s.as_slice())).collect();
        let t = table(&borrowed);

        let one = interpolate(&t, &CountryAliases::builtin(), date(2020, 1, 1), 1);
        let many = interpolate(&t, &CountryAliases::builtin(), date(2020, 1, 1), 8);
        assert_eq!(one, many);
    }

    #[test]
    fn test_empty_table_gives_empty_series() {
        let series = interpolate(&table(&[]), &CountryAliases::builtin(), date(2020, 1, 1), 4);
        assert!(series.is_empty());
        assert_eq!(series.days(), 0);
    }
}
