//! SQLite time-series store
//!
//! One append-mostly table keyed by `(timestamp_ns, tag_name)`. Every sample
//! is persisted, bad ones included, but the read path only ever returns
//! good-quality rows.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::normalize::{Quality, Sample};

pub mod export;

pub use export::FeatureMatrix;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS numeric_time_series (
        timestamp_ns INTEGER NOT NULL,
        tag_name TEXT NOT NULL,
        value REAL NOT NULL,
        quality INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (timestamp_ns, tag_name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_nts_timestamp ON numeric_time_series(timestamp_ns)",
    "CREATE INDEX IF NOT EXISTS idx_nts_tag ON numeric_time_series(tag_name)",
    "CREATE INDEX IF NOT EXISTS idx_nts_timestamp_tag ON numeric_time_series(timestamp_ns, tag_name)",
    "CREATE INDEX IF NOT EXISTS idx_nts_quality ON numeric_time_series(quality)",
];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("at least one tag is required")]
    EmptyTagSet,
    #[error("no sample of the batch at {0} ns could be persisted")]
    EmptyBatch(i64),
    #[error("timestamp {0} is outside the nanosecond range")]
    TimestampOutOfRange(DateTime<Utc>),
}

/// Row counts for operators and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub rows: i64,
    pub good: i64,
    pub bad: i64,
    pub distinct_timestamps: i64,
}

/// Convert a wall-clock time to the stored nanosecond representation
pub fn to_nanos(time: DateTime<Utc>) -> Result<i64, StoreError> {
    time.timestamp_nanos_opt()
        .ok_or(StoreError::TimestampOutOfRange(time))
}

/// Parse either RFC 3339 or integer nanoseconds since the epoch
pub fn parse_time(input: &str) -> Result<DateTime<Utc>, String> {
    let input = input.trim();
    if let Ok(ns) = input.parse::<i64>() {
        return Ok(DateTime::from_timestamp_nanos(ns));
    }
    DateTime::parse_from_rfc3339(input)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", input, e))
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    location: String,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and its schema
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            location: path.display().to_string(),
        };
        store.init_schema().await?;
        info!("SQLite time-series store opened: {}", store.location);
        Ok(store)
    }

    /// Private in-memory database; lives as long as the store
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // a second connection would see a different database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            location: ":memory:".to_string(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Write one poll cycle in a single transaction.
    ///
    /// A sample that fails to insert is logged and skipped. If nothing of the
    /// batch could be written the transaction is rolled back and
    /// [`StoreError::EmptyBatch`] is returned. Returns the number of rows
    /// written.
    pub async fn append_batch(
        &self,
        samples: &[Sample],
        timestamp: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let timestamp_ns = to_nanos(timestamp)?;
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;

        for sample in samples {
            let result = sqlx::query(
                "INSERT INTO numeric_time_series (timestamp_ns, tag_name, value, quality)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(timestamp_ns)
            .bind(&sample.tag)
            .bind(sample.value)
            .bind(sample.quality.code())
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => written += 1,
                Err(e) => warn!(tag = %sample.tag, error = %e, "Failed to write sample, skipping"),
            }
        }

        if written == 0 {
            tx.rollback().await?;
            return Err(StoreError::EmptyBatch(timestamp_ns));
        }

        tx.commit().await?;
        debug!("Committed {}/{} samples at {}", written, samples.len(), timestamp_ns);
        Ok(written)
    }

    /// Good samples of `tags` within `[start, end]`, ordered by time then tag
    pub async fn range_query(
        &self,
        tags: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, StoreError> {
        if tags.is_empty() {
            return Err(StoreError::EmptyTagSet);
        }

        let mut qb = select_good(tags);
        qb.push(" AND timestamp_ns BETWEEN ")
            .push_bind(to_nanos(start)?)
            .push(" AND ")
            .push_bind(to_nanos(end)?)
            .push(" ORDER BY timestamp_ns ASC, tag_name ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(sample_from_row).collect()
    }

    /// The latest `limit` good samples of `tags`, oldest first
    pub async fn recent(&self, tags: &[String], limit: u32) -> Result<Vec<Sample>, StoreError> {
        if tags.is_empty() {
            return Err(StoreError::EmptyTagSet);
        }

        let mut qb = select_good(tags);
        qb.push(" ORDER BY timestamp_ns DESC, tag_name DESC LIMIT ")
            .push_bind(i64::from(limit));

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut samples = rows
            .iter()
            .map(sample_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        samples.reverse();
        Ok(samples)
    }

    /// Delete every sample, any quality, strictly older than `older_than`
    pub async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = to_nanos(older_than)?;
        let result = sqlx::query("DELETE FROM numeric_time_series WHERE timestamp_ns < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        info!("Pruned {} samples older than {}", deleted, older_than);
        Ok(deleted)
    }

    /// Wide matrix of a range query: one row per timestamp, one column per tag
    pub async fn feature_matrix(
        &self,
        tags: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<FeatureMatrix, StoreError> {
        let samples = self.range_query(tags, start, end).await?;
        Ok(FeatureMatrix::from_samples(tags, &samples))
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COALESCE(SUM(CASE WHEN quality = 0 THEN 1 ELSE 0 END), 0) AS good,
                    COUNT(DISTINCT timestamp_ns) AS distinct_timestamps
             FROM numeric_time_series",
        )
        .fetch_one(&self.pool)
        .await?;

        let rows: i64 = row.try_get("total")?;
        let good: i64 = row.try_get("good")?;
        Ok(StoreStats {
            rows,
            good,
            bad: rows - good,
            distinct_timestamps: row.try_get("distinct_timestamps")?,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("SQLite time-series store closed: {}", self.location);
    }
}

fn select_good(tags: &[String]) -> QueryBuilder<'_, Sqlite> {
    let mut qb = QueryBuilder::new(
        "SELECT timestamp_ns, tag_name, value, quality FROM numeric_time_series WHERE quality = 0 AND tag_name IN (",
    );
    let mut separated = qb.separated(", ");
    for tag in tags {
        separated.push_bind(tag);
    }
    separated.push_unseparated(")");
    qb
}

fn sample_from_row(row: &SqliteRow) -> Result<Sample, StoreError> {
    Ok(Sample {
        timestamp_ns: row.try_get("timestamp_ns")?,
        tag: row.try_get("tag_name")?,
        value: row.try_get("value")?,
        quality: Quality::from_code(row.try_get("quality")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(tag: &str, value: f64, quality: Quality) -> Sample {
        Sample {
            timestamp_ns: 0,
            tag: tag.to_string(),
            value,
            quality,
        }
    }

    fn at(ns: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(ns)
    }

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_range_query_hides_bad_samples() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let batch = vec![
            sample("plantA/temp", 43.0, Quality::Good),
            sample("plantA/running", 1.0, Quality::Good),
            sample("plantA/huge", 0.0, Quality::Bad),
        ];
        assert_eq!(store.append_batch(&batch, at(1_000)).await.unwrap(), 3);

        let result = store
            .range_query(
                &tags(&["plantA/temp", "plantA/running", "plantA/huge"]),
                at(0),
                at(2_000),
            )
            .await
            .unwrap();

        let names: Vec<_> = result.iter().map(|s| s.tag.as_str()).collect();
        assert_eq!(names, vec!["plantA/running", "plantA/temp"]);
        assert!(result.iter().all(|s| s.quality == Quality::Good));
        assert!(result.iter().all(|s| s.timestamp_ns == 1_000));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.rows, 3);
        assert_eq!(stats.bad, 1);
        assert_eq!(stats.distinct_timestamps, 1);
    }

    #[tokio::test]
    async fn test_range_bounds_are_inclusive() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        for ns in [100, 200, 300] {
            store
                .append_batch(&[sample("a/x", ns as f64, Quality::Good)], at(ns))
                .await
                .unwrap();
        }

        let result = store.range_query(&tags(&["a/x"]), at(100), at(200)).await.unwrap();
        let values: Vec<_> = result.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![100.0, 200.0]);
    }

    #[tokio::test]
    async fn test_empty_tag_set_is_rejected() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        assert!(matches!(
            store.range_query(&[], at(0), at(1)).await,
            Err(StoreError::EmptyTagSet)
        ));
        assert!(matches!(
            store.recent(&[], 5).await,
            Err(StoreError::EmptyTagSet)
        ));
    }

    #[tokio::test]
    async fn test_recent_is_chronological() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        for (i, value) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            store
                .append_batch(
                    &[sample("plantA/temp", value, Quality::Good)],
                    at(1_000 * (i as i64 + 1)),
                )
                .await
                .unwrap();
        }

        let recent = store.recent(&tags(&["plantA/temp"]), 3).await.unwrap();
        let values: Vec<_> = recent.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![10.0, 20.0, 30.0]);

        let latest = store.recent(&tags(&["plantA/temp"]), 2).await.unwrap();
        let values: Vec<_> = latest.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![20.0, 30.0]);
    }

    #[tokio::test]
    async fn test_duplicate_key_is_rejected_not_overwritten() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .append_batch(&[sample("a/x", 1.0, Quality::Good)], at(5))
            .await
            .unwrap();

        // the only sample collides, so nothing is written and the batch fails
        let err = store
            .append_batch(&[sample("a/x", 2.0, Quality::Good)], at(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EmptyBatch(5)));

        // a colliding sample is skipped while the rest of the batch commits
        let written = store
            .append_batch(
                &[
                    sample("a/x", 3.0, Quality::Good),
                    sample("a/y", 4.0, Quality::Good),
                ],
                at(5),
            )
            .await
            .unwrap();
        assert_eq!(written, 1);

        let rows = store.range_query(&tags(&["a/x", "a/y"]), at(0), at(10)).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value, 1.0);
        assert_eq!(rows[1].value, 4.0);
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_failure() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        assert!(matches!(
            store.append_batch(&[], at(1)).await,
            Err(StoreError::EmptyBatch(1))
        ));
        assert_eq!(store.stats().await.unwrap().rows, 0);
    }

    #[tokio::test]
    async fn test_prune_removes_strictly_older_rows() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        for ns in [10, 20, 30] {
            store
                .append_batch(
                    &[
                        sample("a/x", 1.0, Quality::Good),
                        sample("a/bad", 0.0, Quality::Bad),
                    ],
                    at(ns),
                )
                .await
                .unwrap();
        }

        assert_eq!(store.prune(at(20)).await.unwrap(), 2);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.rows, 4);
        assert_eq!(stats.distinct_timestamps, 2);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("plc_data.db");

        let store = SqliteStore::open(&path).await.unwrap();
        store
            .append_batch(&[sample("a/x", 7.0, Quality::Good)], at(42))
            .await
            .unwrap();
        store.close().await;

        let reopened = SqliteStore::open(&path).await.unwrap();
        let rows = reopened.recent(&tags(&["a/x"]), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp_ns, 42);
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("1500").unwrap(), at(1500));
        assert_eq!(
            parse_time("2024-01-15T00:00:00Z").unwrap().timestamp(),
            1_705_276_800
        );
        assert!(parse_time("yesterday").is_err());
    }
}
