//! Inventory CSV export and the parsing of bundle side files.
//!
//! The final artifact carries an `Info.csv` describing every harvested
//! result. Provider bundles ship their own `Info.csv` with per-file
//! metadata, which is parsed here and merged back into the store.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use thiserror::Error;
use tracing::{debug, warn};

use crate::fsutil;
use crate::store::{
    ResultRecord, ResultStore, StoreError, format_provider_date, parse_provider_date,
};

/// Name of the inventory side file, both in provider bundles and in the
/// final artifact.
pub const INVENTORY_FILE_NAME: &str = "Info.csv";

/// Errors raised while exporting or parsing inventory files.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// A CSV row could not be written or decoded.
    #[error("CSV error in {path}: {source}")]
    Csv {
        /// The inventory file involved.
        path: PathBuf,
        /// The underlying CSV error.
        #[source]
        source: csv::Error,
    },

    /// File system error while reading or flushing an inventory file.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file is empty or otherwise missing its header row.
    #[error("inventory file {path} has no header row")]
    MissingHeader {
        /// The inventory file involved.
        path: PathBuf,
    },

    /// The result store failed while records were being exported.
    #[error("result store error during inventory export: {0}")]
    Store(#[from] StoreError),
}

impl InventoryError {
    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

struct InventoryColumn {
    header: &'static str,
    excluded: bool,
    render: fn(&ResultRecord) -> String,
}

/// Fixed export mapping. Order here is the column order of the written
/// file; excluded columns belong to a later parsing stage and never
/// leave the store.
const COLUMNS: &[InventoryColumn] = &[
    InventoryColumn {
        header: "System ID",
        excluded: false,
        render: |r| r.system_id.clone(),
    },
    InventoryColumn {
        header: "Name",
        excluded: false,
        render: |r| r.name.clone(),
    },
    InventoryColumn {
        header: "Bucket",
        excluded: false,
        render: |r| r.bucket.clone(),
    },
    InventoryColumn {
        header: "Media",
        excluded: false,
        render: |r| r.media.clone(),
    },
    InventoryColumn {
        header: "Type",
        excluded: false,
        render: |r| r.kind.clone(),
    },
    InventoryColumn {
        header: "Size",
        excluded: false,
        render: |r| r.size.to_string(),
    },
    InventoryColumn {
        header: "Date",
        excluded: false,
        render: |r| format_provider_date(&r.date),
    },
    InventoryColumn {
        header: "Filename",
        excluded: false,
        render: |r| r.filename.clone().unwrap_or_default(),
    },
    InventoryColumn {
        header: "Downloaded",
        excluded: false,
        render: |r| r.downloaded.to_string(),
    },
    InventoryColumn {
        header: "Simhash",
        excluded: false,
        render: |r| r.simhash.to_string(),
    },
    InventoryColumn {
        header: "Tags",
        excluded: true,
        render: |_| String::new(),
    },
    InventoryColumn {
        header: "Relations",
        excluded: true,
        render: |_| String::new(),
    },
    InventoryColumn {
        header: "NearText",
        excluded: true,
        render: |_| String::new(),
    },
];

/// Header row of the exported inventory, in column order.
#[must_use]
pub fn inventory_headers() -> Vec<&'static str> {
    COLUMNS
        .iter()
        .filter(|column| !column.excluded)
        .map(|column| column.header)
        .collect()
}

/// Writes every record in the store to a CSV file at `path`.
///
/// Returns the number of data rows written.
///
/// # Errors
///
/// Returns [`InventoryError::Store`] when the store cannot be read and
/// [`InventoryError::Csv`] / [`InventoryError::Io`] when writing fails.
pub async fn write_inventory(store: &ResultStore, path: &Path) -> Result<usize, InventoryError> {
    let records = store.all_records().await?;

    let mut writer = csv::Writer::from_path(path).map_err(|e| InventoryError::csv(path, e))?;
    writer
        .write_record(inventory_headers())
        .map_err(|e| InventoryError::csv(path, e))?;
    for record in &records {
        let row: Vec<String> = COLUMNS
            .iter()
            .filter(|column| !column.excluded)
            .map(|column| (column.render)(record))
            .collect();
        writer
            .write_record(&row)
            .map_err(|e| InventoryError::csv(path, e))?;
    }
    writer.flush().map_err(|e| InventoryError::io(path, e))?;

    debug!(rows = records.len(), path = %path.display(), "inventory written");
    Ok(records.len())
}

/// Parses a bundle side file into result records.
///
/// Columns are located by header name, case-insensitively, so provider
/// variations in column order survive. A UTF-8 BOM is tolerated. Rows
/// without a system ID are skipped with a warning; unparsable sizes
/// fall back to zero and unparsable dates to the current time.
///
/// # Errors
///
/// Returns [`InventoryError::Io`] when the file cannot be read,
/// [`InventoryError::MissingHeader`] when it has no header row, and
/// [`InventoryError::Csv`] when a row cannot be decoded.
pub fn parse_inventory(path: &Path) -> Result<Vec<ResultRecord>, InventoryError> {
    let raw = fs::read(path).map_err(|e| InventoryError::io(path, e))?;
    let data = fsutil::strip_utf8_bom(&raw);

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(data);
    let mut rows = reader.records();

    let Some(header_row) = rows.next() else {
        return Err(InventoryError::MissingHeader {
            path: path.to_path_buf(),
        });
    };
    let header_row = header_row.map_err(|e| InventoryError::csv(path, e))?;
    let positions: HashMap<String, usize> = header_row
        .iter()
        .enumerate()
        .map(|(index, name)| (name.trim().to_lowercase(), index))
        .collect();

    let field = |row: &csv::StringRecord, name: &str| -> String {
        positions
            .get(name)
            .and_then(|&index| row.get(index))
            .unwrap_or_default()
            .trim()
            .to_string()
    };

    let mut records = Vec::new();
    for row in rows {
        let row = row.map_err(|e| InventoryError::csv(path, e))?;

        let system_id = field(&row, "system id").to_lowercase();
        if system_id.is_empty() {
            warn!(path = %path.display(), "skipping inventory row without system id");
            continue;
        }

        let mut record = ResultRecord::new(system_id, parse_provider_date(&field(&row, "date")));
        record.name = field(&row, "name");
        record.bucket = field(&row, "bucket");
        record.media = field(&row, "media");
        record.kind = {
            let kind = field(&row, "type");
            if kind.is_empty() {
                // Some bundle exports label the column "Content Type".
                field(&row, "content type")
            } else {
                kind
            }
        };
        record.size = field(&row, "size").parse().unwrap_or(0);
        records.push(record);
    }

    debug!(rows = records.len(), path = %path.display(), "inventory parsed");
    Ok(records)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn sample_record(id: &str) -> ResultRecord {
        let mut record = ResultRecord::new(
            id.to_string(),
            Utc.with_ymd_and_hms(2023, 5, 17, 10, 30, 0).unwrap(),
        );
        record.name = format!("leak-{id}.txt");
        record.bucket = "leaks.public".to_string();
        record.media = "24".to_string();
        record.kind = "1".to_string();
        record.size = 4096;
        record
    }

    #[test]
    fn test_inventory_headers_exclude_parsing_stage_columns() {
        let headers = inventory_headers();
        assert_eq!(
            headers,
            vec![
                "System ID",
                "Name",
                "Bucket",
                "Media",
                "Type",
                "Size",
                "Date",
                "Filename",
                "Downloaded",
                "Simhash",
            ]
        );
        assert!(!headers.contains(&"NearText"));
        assert!(!headers.contains(&"Tags"));
        assert!(!headers.contains(&"Relations"));
    }

    #[tokio::test]
    async fn test_write_inventory_exports_all_records() {
        let store = ResultStore::open_in_memory().await.unwrap();
        store.insert_if_absent(&sample_record("aaa")).await.unwrap();
        store.insert_if_absent(&sample_record("bbb")).await.unwrap();
        store.mark_downloaded("bbb", "leak-bbb.txt").await.unwrap();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INVENTORY_FILE_NAME);
        let rows = write_inventory(&store, &path).await.unwrap();
        assert_eq!(rows, 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "System ID,Name,Bucket,Media,Type,Size,Date,Filename,Downloaded,Simhash"
        );
        assert_eq!(
            lines[1],
            "aaa,leak-aaa.txt,leaks.public,24,1,4096,2023-05-17 10:30:00,,false,0"
        );
        assert_eq!(
            lines[2],
            "bbb,leak-bbb.txt,leaks.public,24,1,4096,2023-05-17 10:30:00,leak-bbb.txt,true,0"
        );
    }

    #[tokio::test]
    async fn test_write_inventory_empty_store_writes_header_only() {
        let store = ResultStore::open_in_memory().await.unwrap();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INVENTORY_FILE_NAME);

        let rows = write_inventory(&store, &path).await.unwrap();
        assert_eq!(rows, 0);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn test_parse_inventory_reads_provider_side_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INVENTORY_FILE_NAME);
        std::fs::write(
            &path,
            "System ID,Name,Bucket,Media,Content Type,Size,Date\n\
             ABC-123,dump.sql,leaks.private,24,2,987,2022-11-02 08:00:01\n",
        )
        .unwrap();

        let records = parse_inventory(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].system_id, "abc-123");
        assert_eq!(records[0].name, "dump.sql");
        assert_eq!(records[0].bucket, "leaks.private");
        assert_eq!(records[0].media, "24");
        assert_eq!(records[0].kind, "2");
        assert_eq!(records[0].size, 987);
        assert_eq!(format_provider_date(&records[0].date), "2022-11-02 08:00:01");
    }

    #[test]
    fn test_parse_inventory_tolerates_bom_and_column_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INVENTORY_FILE_NAME);
        let mut content = Vec::from(&b"\xef\xbb\xbf"[..]);
        content.extend_from_slice(
            b"Date,Size,System ID,Name\n2021-01-05 00:00:00,12,xyz,creds.txt\n",
        );
        std::fs::write(&path, content).unwrap();

        let records = parse_inventory(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].system_id, "xyz");
        assert_eq!(records[0].name, "creds.txt");
        assert_eq!(records[0].size, 12);
    }

    #[test]
    fn test_parse_inventory_skips_rows_without_system_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INVENTORY_FILE_NAME);
        std::fs::write(
            &path,
            "System ID,Name,Size,Date\n\
             ,orphan.txt,5,2021-01-01 00:00:00\n\
             ok,kept.txt,9,2021-01-01 00:00:00\n",
        )
        .unwrap();

        let records = parse_inventory(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].system_id, "ok");
    }

    #[test]
    fn test_parse_inventory_defaults_bad_size_to_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INVENTORY_FILE_NAME);
        std::fs::write(
            &path,
            "System ID,Size,Date\nabc,not-a-number,2021-01-01 00:00:00\n",
        )
        .unwrap();

        let records = parse_inventory(&path).unwrap();
        assert_eq!(records[0].size, 0);
    }

    #[test]
    fn test_parse_inventory_empty_file_is_missing_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INVENTORY_FILE_NAME);
        std::fs::write(&path, "").unwrap();

        let error = parse_inventory(&path).unwrap_err();
        assert!(matches!(error, InventoryError::MissingHeader { .. }));
    }

    #[test]
    fn test_parse_inventory_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let error = parse_inventory(&dir.path().join("absent.csv")).unwrap_err();
        assert!(matches!(error, InventoryError::Io { .. }));
    }

    #[tokio::test]
    async fn test_inventory_roundtrip() {
        let store = ResultStore::open_in_memory().await.unwrap();
        store.insert_if_absent(&sample_record("r1")).await.unwrap();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INVENTORY_FILE_NAME);
        write_inventory(&store, &path).await.unwrap();

        let records = parse_inventory(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].system_id, "r1");
        assert_eq!(records[0].name, "leak-r1.txt");
        assert_eq!(records[0].size, 4096);
    }
}
