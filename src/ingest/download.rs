/// Dataset download for the `fetch` command.
///
/// Each configured source with a `url` is fetched over HTTPS and written to
/// its configured path. The body goes to a temporary file next to the
/// destination first and is renamed into place only once complete, so an
/// interrupted download never leaves a truncated CSV behind.

use crate::config::{EtlConfig, SourceFile};
use crate::model::SourceError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Result of fetching one source.
#[derive(Debug)]
pub struct DownloadOutcome {
    pub archive_table: String,
    pub path: PathBuf,
    /// Bytes written, or why the download failed.
    pub result: Result<u64, SourceError>,
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

fn download_error(url: &str, reason: impl ToString) -> SourceError {
    SourceError::Download {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

/// Temporary sibling of `dest` used while the body is written.
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Downloads `url` to `dest`. Returns bytes written.
pub fn fetch_source(
    client: &reqwest::blocking::Client,
    url: &str,
    dest: &Path,
) -> Result<u64, SourceError> {
    let mut response = client.get(url).send().map_err(|e| download_error(url, e))?;

    if !response.status().is_success() {
        return Err(download_error(url, format!("HTTP {}", response.status())));
    }

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| SourceError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let partial = partial_path(dest);
    let written = {
        let mut file = std::fs::File::create(&partial).map_err(|source| SourceError::Io {
            path: partial.clone(),
            source,
        })?;
        response.copy_to(&mut file).map_err(|e| download_error(url, e))
    };
    let written = match written {
        Ok(n) => n,
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
    };

    std::fs::rename(&partial, dest).map_err(|source| SourceError::Io {
        path: dest.to_path_buf(),
        source,
    })?;
    Ok(written)
}

/// Fetches every source that has a `url`. Sources without one are skipped.
pub fn fetch_all(config: &EtlConfig) -> Result<Vec<DownloadOutcome>, SourceError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| download_error("<client>", e))?;

    let mut outcomes = Vec::new();
    for source in config.sources.all() {
        let Some(url) = source.url.as_deref() else {
            continue;
        };
        let result = fetch_source(&client, url, &source.path);
        log_outcome(source, &result);
        outcomes.push(DownloadOutcome {
            archive_table: source.archive_table.clone(),
            path: source.path.clone(),
            result,
        });
    }
    Ok(outcomes)
}

fn log_outcome(source: &SourceFile, result: &Result<u64, SourceError>) {
    match result {
        Ok(bytes) => info!(table = %source.archive_table, "downloaded {} bytes to {}", bytes, source.path.display()),
        Err(e) => warn!(table = %source.archive_table, "download failed: {}", e),
    }
}

/// Prints one line per source and returns how many failed.
pub fn print_summary(outcomes: &[DownloadOutcome]) -> usize {
    println!("\n{}", "=".repeat(60));
    println!("DOWNLOAD SUMMARY");
    println!("{}", "=".repeat(60));

    if outcomes.is_empty() {
        println!("No source has a url configured.");
    }
    for outcome in outcomes {
        match &outcome.result {
            Ok(bytes) => println!("  ✓ {:<40} {} bytes", outcome.archive_table, bytes),
            Err(e) => println!("  ✗ {:<40} {}", outcome.archive_table, e),
        }
    }

    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    println!("\n{} downloaded, {} failed", outcomes.len() - failed, failed);
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_path_is_a_sibling() {
        assert_eq!(
            partial_path(Path::new("files/vaccinations.csv")),
            PathBuf::from("files/vaccinations.csv.part")
        );
    }

    #[test]
    fn test_summary_counts_failures() {
        let outcomes = vec![
            DownloadOutcome {
                archive_table: "vaccinations".to_string(),
                path: PathBuf::from("files/vaccinations.csv"),
                result: Ok(10),
            },
            DownloadOutcome {
                archive_table: "owid_monkeypox_data".to_string(),
                path: PathBuf::from("files/owid_monkeypox_data.csv"),
                result: Err(download_error("https://example.org/x.csv", "HTTP 404 Not Found")),
            },
        ];
        assert_eq!(print_summary(&outcomes), 1);
    }
}
