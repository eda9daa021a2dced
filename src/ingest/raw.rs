/// Untyped source reader for the archive mirror.
///
/// Every data row is kept as read, whitespace included, keyed by its 1-based
/// position in the file. Bytes that are not valid UTF-8 are replaced with
/// U+FFFD so the row still reaches the archive.

use crate::model::{RawArchiveRecord, SourceError};
use csv::ByteRecord;
use std::fs::File;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    /// Header names, trimmed so they match the archive DDL.
    pub headers: Vec<String>,
    pub rows: Vec<RawArchiveRecord>,
    /// Rows the CSV reader could not read at all (I/O errors).
    pub unreadable: usize,
}

fn lossy(field: &[u8]) -> String {
    String::from_utf8_lossy(field).into_owned()
}

pub fn read_raw(path: &Path) -> Result<RawTable, SourceError> {
    let file = File::open(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::None)
        .from_reader(file);

    let headers: Vec<String> = reader
        .byte_headers()
        .map_err(|source| SourceError::Csv {
            path: path.to_path_buf(),
            source,
        })?
        .iter()
        .map(|h| lossy(h).trim().to_string())
        .collect();
    let width = headers.len();

    let mut rows = Vec::new();
    let mut unreadable = 0;
    let mut record = ByteRecord::new();
    let mut source_row = 0i64;
    loop {
        match reader.read_byte_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                source_row += 1;
                // Short rows are padded, long rows truncated, to the header width.
                let mut values: Vec<String> = record.iter().take(width).map(lossy).collect();
                values.resize(width, String::new());
                rows.push(RawArchiveRecord { source_row, values });
            }
            Err(e) => {
                source_row += 1;
                debug!(path = %path.display(), row = source_row, "unreadable row: {}", e);
                unreadable += 1;
                if e.is_io_error() {
                    break;
                }
            }
        }
    }

    Ok(RawTable {
        headers,
        rows,
        unreadable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rows_are_numbered_from_one_and_padded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"country,continent\nFrance,Europe\nPeru\nChile,South America,extra\n")
            .unwrap();

        let table = read_raw(&path).unwrap();
        assert_eq!(table.headers, vec!["country", "continent"]);
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.rows[0].source_row, 1);
        assert_eq!(table.rows[1].values, vec!["Peru".to_string(), String::new()]);
        assert_eq!(table.rows[2].values.len(), 2);
        assert_eq!(table.unreadable, 0);
    }

    #[test]
    fn test_values_are_archived_untrimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        std::fs::write(&path, "country , continent\n  Viet Nam ,Asia \n").unwrap();

        let table = read_raw(&path).unwrap();
        assert_eq!(table.headers, vec!["country", "continent"]);
        assert_eq!(
            table.rows[0].values,
            vec!["  Viet Nam ".to_string(), "Asia ".to_string()]
        );
    }

    #[test]
    fn test_invalid_utf8_rows_are_archived_lossily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"country,continent\nC\xf4te d'Ivoire,Africa\nPeru,South America\n")
            .unwrap();

        let table = read_raw(&path).unwrap();
        assert_eq!(table.unreadable, 0);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].source_row, 1);
        assert_eq!(table.rows[0].values[0], "C\u{FFFD}te d'Ivoire");
        assert_eq!(table.rows[1].source_row, 2);
    }
}
