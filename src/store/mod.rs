//! Run-scoped result store.
//!
//! This module provides the `SQLite`-backed store that deduplicates search
//! results for a single harvest run:
//! - [`ResultStore`] - connection pool, schema, and record operations
//! - [`ResultRecord`] - one row per unique provider record
//!
//! Deduplication relies on the `UNIQUE` constraint on `system_id`: the
//! insert-if-absent operation is a single atomic statement, so concurrent
//! workers never need an external lock.
//!
//! # Example
//!
//! ```ignore
//! use leakharvest_core::store::{ResultRecord, ResultStore};
//!
//! let store = ResultStore::open(Path::new("info.sqlite3")).await?;
//! let fresh = store.insert_if_absent(&record).await?;
//! if !fresh {
//!     // a concurrent worker already stored this system_id
//! }
//! ```

mod record;

pub use record::ResultRecord;
pub(crate) use record::{PROVIDER_DATE_FORMAT, format_provider_date, parse_provider_date};

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Default maximum number of connections in the pool.
/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
/// Connections will wait this long before returning SQLITE_BUSY.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Rows per multi-row INSERT when merging inventory records.
const MERGE_BATCH_SIZE: usize = 50;

/// Store-related errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to connect to or query the database.
    #[error("result store database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run result store migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Deduplicating store for harvested search results.
///
/// Lives inside the run workspace and is packed into the final archive
/// together with the artifacts, so a run's raw data stays reviewable.
#[derive(Debug, Clone)]
pub struct ResultStore {
    pool: SqlitePool,
}

impl ResultStore {
    /// Opens (creating if needed) the store at the given path.
    ///
    /// Enables WAL mode for concurrent access from the dedup workers and
    /// runs any pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails,
    /// or [`StoreError::Migration`] if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        // WAL mode so dedup workers can read while another writes
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;

        // Wait instead of failing immediately with SQLITE_BUSY
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails,
    /// or [`StoreError::Migration`] if migrations fail.
    #[instrument]
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Inserts a record unless its `system_id` is already present.
    ///
    /// Returns `true` when the record was new and `false` when a row with
    /// the same `system_id` already existed. The decision happens inside a
    /// single `INSERT ... ON CONFLICT DO NOTHING`, so it is race-free
    /// across concurrent workers.
    ///
    /// The `simhash`, `tags`, `relations`, and `near_text` fields are
    /// always written empty; populating them is the parsing stage's job.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self, record), fields(system_id = %record.system_id))]
    pub async fn insert_if_absent(&self, record: &ResultRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"INSERT INTO result_item (
                system_id,
                name,
                bucket,
                media,
                kind,
                size,
                date,
                filename,
                downloaded,
                simhash,
                tags,
                relations,
                near_text
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, NULL, '')
              ON CONFLICT(system_id) DO NOTHING",
        )
        .bind(record.system_id.as_str())
        .bind(record.name.as_str())
        .bind(record.bucket.as_str())
        .bind(record.media.as_str())
        .bind(record.kind.as_str())
        .bind(record.size)
        .bind(record.date)
        .bind(record.filename.as_deref())
        .bind(record.downloaded)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Merges a batch of records, skipping any `system_id` already stored.
    ///
    /// Used for provider inventory side files. Returns the number of rows
    /// actually inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if an insert fails.
    #[instrument(skip(self, records), fields(count = records.len()))]
    pub async fn merge_records(&self, records: &[ResultRecord]) -> Result<u64, StoreError> {
        let mut inserted = 0u64;

        for chunk in records.chunks(MERGE_BATCH_SIZE) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO result_item (system_id, name, bucket, media, kind, size, date, \
                 filename, downloaded, simhash, tags, relations, near_text) ",
            );
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.system_id.as_str())
                    .push_bind(record.name.as_str())
                    .push_bind(record.bucket.as_str())
                    .push_bind(record.media.as_str())
                    .push_bind(record.kind.as_str())
                    .push_bind(record.size)
                    .push_bind(record.date)
                    .push_bind(record.filename.as_deref())
                    .push_bind(record.downloaded)
                    .push_bind(0i64)
                    .push_bind(None::<String>)
                    .push_bind(None::<String>)
                    .push_bind("");
            });
            builder.push(" ON CONFLICT(system_id) DO NOTHING");

            let result = builder.build().execute(&self.pool).await?;
            inserted += result.rows_affected();
        }

        Ok(inserted)
    }

    /// Marks a record's artifact as downloaded and stores its file name.
    ///
    /// Returns `false` when no row matches the `system_id`, which means an
    /// extracted file had no corresponding record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_downloaded(
        &self,
        system_id: &str,
        filename: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"UPDATE result_item
              SET filename = ?, downloaded = 1
              WHERE system_id = ?",
        )
        .bind(filename)
        .bind(system_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns the number of stored records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM result_item")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Returns the oldest record date, or `None` when the store is empty.
    ///
    /// This is what the next search window's upper bound is derived from.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn oldest_date(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let oldest: Option<DateTime<Utc>> = sqlx::query_scalar("SELECT min(date) FROM result_item")
            .fetch_one(&self.pool)
            .await?;

        Ok(oldest)
    }

    /// Fetches a single record by `system_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn get(&self, system_id: &str) -> Result<Option<ResultRecord>, StoreError> {
        let record =
            sqlx::query_as::<_, ResultRecord>("SELECT * FROM result_item WHERE system_id = ?")
                .bind(system_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    /// Returns every stored record in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn all_records(&self) -> Result<Vec<ResultRecord>, StoreError> {
        let records = sqlx::query_as::<_, ResultRecord>("SELECT * FROM result_item ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Gracefully closes all connections in the pool.
    ///
    /// Closing the last connection checkpoints the WAL back into the main
    /// database file, which must happen before the file is packed into the
    /// final archive.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}
