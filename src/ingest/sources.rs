/// Typed readers for the five source CSV files.
///
/// Each reader locates its columns by header name (case-insensitive), so
/// column order and extra columns do not matter. A row that cannot be read
/// (bad UTF-8, unparseable date or number, empty country) is skipped and
/// counted in `SourceRows::malformed`; a missing file or missing required
/// column is a `SourceError` for that file only.

use crate::config::EtlConfig;
use crate::logging::DataSource;
use crate::model::{Disease, SourceError};
use chrono::NaiveDate;
use csv::StringRecord;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Field parsing
// ---------------------------------------------------------------------------

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// Parses the date part of a source field. Anything after the first space or
/// `T` (a time of day) is ignored.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let day = raw
        .trim()
        .split(|c: char| c.is_whitespace() || c == 'T')
        .next()?;
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(day, fmt).ok())
}

/// Empty fields are `Ok(None)`; text that is not a number is `Err(())`.
fn parse_number(raw: Option<&str>) -> Result<Option<f64>, ()> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => text.parse::<f64>().map(Some).map_err(|_| ()),
    }
}

// ---------------------------------------------------------------------------
// Reader plumbing
// ---------------------------------------------------------------------------

/// Rows read from one file plus the number of rows that were skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRows<T> {
    pub rows: Vec<T>,
    pub malformed: usize,
}

impl<T> Default for SourceRows<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            malformed: 0,
        }
    }
}

impl<T> SourceRows<T> {
    /// Rows read, kept or not.
    pub fn input(&self) -> usize {
        self.rows.len() + self.malformed
    }
}

pub(crate) fn open_reader(path: &Path) -> Result<csv::Reader<File>, SourceError> {
    let file = File::open(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file))
}

pub(crate) fn read_headers(
    reader: &mut csv::Reader<File>,
    path: &Path,
) -> Result<Vec<String>, SourceError> {
    let headers = reader.headers().map_err(|source| SourceError::Csv {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(headers.iter().map(|h| h.trim().to_string()).collect())
}

/// Header positions of one file.
struct Columns {
    path: PathBuf,
    headers: Vec<String>,
}

impl Columns {
    fn read(reader: &mut csv::Reader<File>, path: &Path) -> Result<Self, SourceError> {
        Ok(Self {
            path: path.to_path_buf(),
            headers: read_headers(reader, path)?,
        })
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.eq_ignore_ascii_case(name))
    }

    /// Position of the first of `names` present in the header.
    fn require(&self, names: &[&str]) -> Result<usize, SourceError> {
        names
            .iter()
            .find_map(|name| self.find(name))
            .ok_or_else(|| SourceError::MissingColumn {
                path: self.path.clone(),
                column: names.join("|"),
            })
    }
}

fn field(record: &StringRecord, index: usize) -> Option<&str> {
    record.get(index).map(str::trim).filter(|s| !s.is_empty())
}

/// Feeds every record to `parse`, counting the ones it rejects.
fn collect_rows<T, F>(
    mut reader: csv::Reader<File>,
    path: &Path,
    mut parse: F,
) -> SourceRows<T>
where
    F: FnMut(&StringRecord) -> Option<T>,
{
    let mut out = SourceRows::default();
    for (i, result) in reader.records().enumerate() {
        let parsed = match result {
            Ok(record) => parse(&record),
            Err(e) => {
                debug!(path = %path.display(), row = i + 1, "unreadable row: {}", e);
                None
            }
        };
        match parsed {
            Some(row) => out.rows.push(row),
            None => out.malformed += 1,
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Countries and continents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CountryRow {
    pub country: String,
    pub continent: String,
}

pub fn read_countries(path: &Path) -> Result<SourceRows<CountryRow>, SourceError> {
    let mut reader = open_reader(path)?;
    let columns = Columns::read(&mut reader, path)?;
    let country = columns.require(&["country"])?;
    let continent = columns.require(&["continent"])?;

    Ok(collect_rows(reader, path, |record| {
        Some(CountryRow {
            country: field(record, country)?.to_string(),
            continent: field(record, continent).unwrap_or_default().to_string(),
        })
    }))
}

// ---------------------------------------------------------------------------
// Population (wide: one column per year)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PopulationRow {
    pub country: String,
    /// (year, millions of inhabitants), in column order.
    pub samples: Vec<(i32, f64)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PopulationTable {
    /// Every year column in the header.
    pub years: Vec<i32>,
    pub rows: Vec<PopulationRow>,
    pub malformed: usize,
}

impl PopulationTable {
    /// Latest year that has at least one sample anywhere in the table.
    pub fn max_sampled_year(&self) -> Option<i32> {
        self.rows
            .iter()
            .flat_map(|r| r.samples.iter().map(|(year, _)| *year))
            .max()
    }

    pub fn input(&self) -> usize {
        self.rows.len() + self.malformed
    }
}

pub fn read_population(path: &Path) -> Result<PopulationTable, SourceError> {
    let mut reader = open_reader(path)?;
    let columns = Columns::read(&mut reader, path)?;
    let country = columns.require(&["country"])?;

    let year_columns: Vec<(usize, i32)> = columns
        .headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != country)
        .filter_map(|(i, h)| h.parse::<i32>().ok().map(|year| (i, year)))
        .collect();
    if year_columns.is_empty() {
        return Err(SourceError::MissingColumn {
            path: path.to_path_buf(),
            column: "<year>".to_string(),
        });
    }

    let rows = collect_rows(reader, path, |record| {
        let name = field(record, country)?.to_string();
        let mut samples = Vec::with_capacity(year_columns.len());
        for &(index, year) in &year_columns {
            // Negative or non-finite populations are not samples.
            match parse_number(field(record, index)) {
                Ok(Some(v)) if v.is_finite() && v >= 0.0 => samples.push((year, v)),
                Ok(_) => {}
                Err(()) => return None,
            }
        }
        Some(PopulationRow {
            country: name,
            samples,
        })
    });

    Ok(PopulationTable {
        years: year_columns.iter().map(|(_, year)| *year).collect(),
        rows: rows.rows,
        malformed: rows.malformed,
    })
}

// ---------------------------------------------------------------------------
// Vaccinations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct VaccinationRow {
    pub country: String,
    pub date: NaiveDate,
    pub people_vaccinated: Option<f64>,
}

pub fn read_vaccinations(path: &Path) -> Result<SourceRows<VaccinationRow>, SourceError> {
    let mut reader = open_reader(path)?;
    let columns = Columns::read(&mut reader, path)?;
    let country = columns.require(&["location", "country"])?;
    let date = columns.require(&["date"])?;
    let vaccinated = columns.require(&["people_vaccinated"])?;

    Ok(collect_rows(reader, path, |record| {
        Some(VaccinationRow {
            country: field(record, country)?.to_string(),
            date: parse_date(field(record, date)?)?,
            people_vaccinated: parse_number(field(record, vaccinated)).ok()?,
        })
    }))
}

// ---------------------------------------------------------------------------
// Disease reports
// ---------------------------------------------------------------------------

/// Header names of one disease source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiseaseColumns {
    pub country: &'static str,
    pub date: &'static str,
    pub total_confirmed: &'static str,
    pub total_death: &'static str,
    /// Read according to the disease's `TotalActivePolicy`.
    pub total_active: &'static str,
}

impl DiseaseColumns {
    pub fn for_disease(disease: Disease) -> Self {
        let total_active = disease.total_active_policy().source_column();
        match disease {
            Disease::Covid19 => DiseaseColumns {
                country: "country",
                date: "date",
                total_confirmed: "cumulative_total_cases",
                total_death: "cumulative_total_deaths",
                total_active,
            },
            Disease::Monkeypox => DiseaseColumns {
                country: "location",
                date: "date",
                total_confirmed: "total_cases",
                total_death: "total_deaths",
                total_active,
            },
        }
    }
}

/// One disease source row, still with source country spelling and raw
/// (possibly negative or non-finite) counts.
#[derive(Debug, Clone, PartialEq)]
pub struct DiseaseReportRow {
    pub country: String,
    pub date: NaiveDate,
    pub total_confirmed: Option<f64>,
    pub total_death: Option<f64>,
    pub total_active: Option<f64>,
}

pub fn read_disease_reports(
    path: &Path,
    disease: Disease,
) -> Result<SourceRows<DiseaseReportRow>, SourceError> {
    let names = DiseaseColumns::for_disease(disease);
    let mut reader = open_reader(path)?;
    let columns = Columns::read(&mut reader, path)?;
    let country = columns.require(&[names.country])?;
    let date = columns.require(&[names.date])?;
    let confirmed = columns.require(&[names.total_confirmed])?;
    let death = columns.require(&[names.total_death])?;
    let active = columns.require(&[names.total_active])?;

    Ok(collect_rows(reader, path, |record| {
        Some(DiseaseReportRow {
            country: field(record, country)?.to_string(),
            date: parse_date(field(record, date)?)?,
            total_confirmed: parse_number(field(record, confirmed)).ok()?,
            total_death: parse_number(field(record, death)).ok()?,
            total_active: parse_number(field(record, active)).ok()?,
        })
    }))
}

// ---------------------------------------------------------------------------
// All sources
// ---------------------------------------------------------------------------

/// Everything the transform stage reads. A source that failed to load is
/// empty and its error is kept in `errors`.
#[derive(Debug, Default)]
pub struct SourceBundle {
    pub countries: SourceRows<CountryRow>,
    pub population: PopulationTable,
    pub vaccinations: SourceRows<VaccinationRow>,
    pub covid: SourceRows<DiseaseReportRow>,
    pub monkeypox: SourceRows<DiseaseReportRow>,
    pub errors: Vec<(DataSource, SourceError)>,
}

impl SourceBundle {
    pub fn reports(&self, disease: Disease) -> &SourceRows<DiseaseReportRow> {
        match disease {
            Disease::Covid19 => &self.covid,
            Disease::Monkeypox => &self.monkeypox,
        }
    }
}

pub fn disease_source(disease: Disease) -> DataSource {
    match disease {
        Disease::Covid19 => DataSource::Covid,
        Disease::Monkeypox => DataSource::Monkeypox,
    }
}

fn keep_or_record<T: Default>(
    result: Result<T, SourceError>,
    source: DataSource,
    errors: &mut Vec<(DataSource, SourceError)>,
) -> T {
    match result {
        Ok(rows) => rows,
        Err(e) => {
            warn!(source = %source, "source skipped: {}", e);
            errors.push((source, e));
            T::default()
        }
    }
}

/// Reads all five sources named in `config`.
pub fn load_bundle(config: &EtlConfig) -> SourceBundle {
    let sources = &config.sources;
    let mut errors = Vec::new();

    let countries = keep_or_record(
        read_countries(&sources.countries.path),
        DataSource::Countries,
        &mut errors,
    );
    let population = keep_or_record(
        read_population(&sources.population.path),
        DataSource::Population,
        &mut errors,
    );
    let vaccinations = keep_or_record(
        read_vaccinations(&sources.vaccinations.path),
        DataSource::Vaccinations,
        &mut errors,
    );
    let covid = keep_or_record(
        read_disease_reports(&sources.covid.path, Disease::Covid19),
        DataSource::Covid,
        &mut errors,
    );
    let monkeypox = keep_or_record(
        read_disease_reports(&sources.monkeypox.path, Disease::Monkeypox),
        DataSource::Monkeypox,
        &mut errors,
    );

    SourceBundle {
        countries,
        population,
        vaccinations,
        covid,
        monkeypox,
        errors,
    }
}
