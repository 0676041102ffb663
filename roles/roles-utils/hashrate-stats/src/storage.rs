//! SQLite storage backend for cycle records, period snapshots and event logs.

use crate::types::{EventType, LogEntry, PeriodSnapshot, SourceId, StatRecord};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Durable storage of accepted cycle records.
///
/// Records are append-only; the only removal is an explicit purge of whole periods.
#[async_trait::async_trait]
pub trait StatsRepository: Send + Sync {
    /// Persist one cycle record atomically.
    async fn append(&self, record: &StatRecord) -> Result<()>;

    /// Records of one period in insertion order. With a source, only records
    /// holding a value for that source are returned.
    async fn query(
        &self,
        period_start: DateTime<Utc>,
        source_id: Option<SourceId>,
    ) -> Result<Vec<StatRecord>>;

    /// Most recently persisted record, if any.
    async fn latest_record(&self) -> Result<Option<StatRecord>>;

    /// Delete every record whose `period_start` is strictly before `before`.
    async fn purge(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Keep `snapshot` as the single retained historical period.
    async fn store_period_snapshot(&self, snapshot: &PeriodSnapshot) -> Result<()>;

    async fn latest_period_snapshot(&self) -> Result<Option<PeriodSnapshot>>;

    async fn append_log(&self, entry: &LogEntry) -> Result<()>;

    /// Most recent log entries first.
    async fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>>;

    /// Delete log entries with a timestamp strictly before `before`.
    async fn purge_logs(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<()>;
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StorageError::InvalidArgument(format!("invalid timestamp: {}", ms)))
}

/// SQLite-backed storage implementation.
pub struct SqliteStorage {
    pool: Pool<Sqlite>,
}

impl SqliteStorage {
    /// Open (or create) a database at `db_path`.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Create parent directories if they don't exist
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let connection_options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
                .create_if_missing(true)
                .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connection_options)
            .await?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stat_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                period_start INTEGER NOT NULL,
                was_idle INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One row per source per record; NULL value means rejected or idle
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stat_values (
                record_id INTEGER NOT NULL,
                source_id TEXT NOT NULL,
                value REAL,

                PRIMARY KEY (record_id, source_id),
                FOREIGN KEY (record_id) REFERENCES stat_records(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_records_period_timestamp
            ON stat_records(period_start, timestamp)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS period_snapshots (
                period_start INTEGER PRIMARY KEY,
                period_end INTEGER NOT NULL,
                taken_at INTEGER NOT NULL,
                stats TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stats_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                period_start INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                message TEXT NOT NULL,
                data TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_logs_timestamp
            ON stats_logs(timestamp)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fold joined record/value rows into records, preserving row order.
    fn rows_to_records(rows: Vec<SqliteRow>) -> Result<Vec<StatRecord>> {
        let mut records: Vec<(i64, StatRecord)> = Vec::new();

        for row in rows {
            let id = row.try_get::<i64, _>("id")?;

            if records.last().map(|(last_id, _)| *last_id) != Some(id) {
                records.push((
                    id,
                    StatRecord {
                        timestamp: from_millis(row.try_get::<i64, _>("timestamp")?)?,
                        period_start: from_millis(row.try_get::<i64, _>("period_start")?)?,
                        values: BTreeMap::new(),
                        was_idle: row.try_get::<bool, _>("was_idle")?,
                    },
                ));
            }

            let Some(source) = row.try_get::<Option<String>, _>("source_id")? else {
                continue;
            };
            match source.parse::<SourceId>() {
                Ok(source_id) => {
                    let value = row.try_get::<Option<f64>, _>("value")?;
                    if let Some((_, record)) = records.last_mut() {
                        record.values.insert(source_id, value);
                    }
                }
                Err(e) => tracing::warn!("Skipping stored value for record {}: {}", id, e),
            }
        }

        Ok(records.into_iter().map(|(_, record)| record).collect())
    }

    fn row_to_log(row: &SqliteRow) -> Result<LogEntry> {
        let event_type = row
            .try_get::<String, _>("event_type")?
            .parse::<EventType>()
            .map_err(StorageError::InvalidArgument)?;
        let data = match row.try_get::<Option<String>, _>("data")? {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };

        Ok(LogEntry {
            timestamp: from_millis(row.try_get::<i64, _>("timestamp")?)?,
            period_start: from_millis(row.try_get::<i64, _>("period_start")?)?,
            event_type,
            message: row.try_get::<String, _>("message")?,
            data,
        })
    }
}

#[async_trait::async_trait]
impl StatsRepository for SqliteStorage {
    async fn append(&self, record: &StatRecord) -> Result<()> {
        if !record.is_within_period() {
            return Err(StorageError::InvalidArgument(format!(
                "record timestamp {} outside period starting {}",
                record.timestamp, record.period_start
            )));
        }

        let mut tx = self.pool.begin().await?;

        let latest_period: Option<i64> =
            sqlx::query_scalar("SELECT MAX(period_start) FROM stat_records")
                .fetch_one(&mut *tx)
                .await?;
        if let Some(latest) = latest_period {
            if to_millis(record.period_start) < latest {
                return Err(StorageError::InvalidArgument(format!(
                    "record period {} precedes latest stored period {}",
                    record.period_start,
                    from_millis(latest)?
                )));
            }
        }

        tracing::debug!(
            "Storing stat record: timestamp={}, period_start={}, values={:?}, was_idle={}",
            record.timestamp,
            record.period_start,
            record.values,
            record.was_idle
        );

        let record_id = sqlx::query(
            r#"
            INSERT INTO stat_records (timestamp, period_start, was_idle)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(to_millis(record.timestamp))
        .bind(to_millis(record.period_start))
        .bind(record.was_idle)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for (source_id, value) in &record.values {
            sqlx::query(
                r#"
                INSERT INTO stat_values (record_id, source_id, value)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(record_id)
            .bind(source_id.as_str())
            .bind(*value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        period_start: DateTime<Utc>,
        source_id: Option<SourceId>,
    ) -> Result<Vec<StatRecord>> {
        let rows = match source_id {
            Some(source_id) => {
                sqlx::query(
                    r#"
                    SELECT r.id, r.timestamp, r.period_start, r.was_idle, v.source_id, v.value
                    FROM stat_records r
                    LEFT JOIN stat_values v ON v.record_id = r.id
                    WHERE r.period_start = ?
                      AND EXISTS (
                          SELECT 1 FROM stat_values f
                          WHERE f.record_id = r.id AND f.source_id = ? AND f.value IS NOT NULL
                      )
                    ORDER BY r.timestamp ASC, r.id ASC
                    "#,
                )
                .bind(to_millis(period_start))
                .bind(source_id.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT r.id, r.timestamp, r.period_start, r.was_idle, v.source_id, v.value
                    FROM stat_records r
                    LEFT JOIN stat_values v ON v.record_id = r.id
                    WHERE r.period_start = ?
                    ORDER BY r.timestamp ASC, r.id ASC
                    "#,
                )
                .bind(to_millis(period_start))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Self::rows_to_records(rows)
    }

    async fn latest_record(&self) -> Result<Option<StatRecord>> {
        let rows = sqlx::query(
            r#"
            WITH latest AS (
                SELECT id FROM stat_records
                ORDER BY timestamp DESC, id DESC
                LIMIT 1
            )
            SELECT r.id, r.timestamp, r.period_start, r.was_idle, v.source_id, v.value
            FROM stat_records r
            JOIN latest l ON l.id = r.id
            LEFT JOIN stat_values v ON v.record_id = r.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(Self::rows_to_records(rows)?.pop())
    }

    async fn purge(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM stat_values
            WHERE record_id IN (SELECT id FROM stat_records WHERE period_start < ?)
            "#,
        )
        .bind(to_millis(before))
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM stat_records WHERE period_start < ?")
            .bind(to_millis(before))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        tracing::info!("Purged {} stat records from periods before {}", deleted, before);
        Ok(deleted)
    }

    async fn store_period_snapshot(&self, snapshot: &PeriodSnapshot) -> Result<()> {
        let stats = serde_json::to_string(&snapshot.stats)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM period_snapshots")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO period_snapshots (period_start, period_end, taken_at, stats)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(to_millis(snapshot.period_start))
        .bind(to_millis(snapshot.period_end))
        .bind(to_millis(snapshot.taken_at))
        .bind(stats)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn latest_period_snapshot(&self) -> Result<Option<PeriodSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT period_start, period_end, taken_at, stats
            FROM period_snapshots
            ORDER BY period_start DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(PeriodSnapshot {
                period_start: from_millis(row.try_get::<i64, _>("period_start")?)?,
                period_end: from_millis(row.try_get::<i64, _>("period_end")?)?,
                taken_at: from_millis(row.try_get::<i64, _>("taken_at")?)?,
                stats: serde_json::from_str(&row.try_get::<String, _>("stats")?)?,
            })),
            None => Ok(None),
        }
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        let data = entry.data.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO stats_logs (timestamp, period_start, event_type, message, data)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_millis(entry.timestamp))
        .bind(to_millis(entry.period_start))
        .bind(entry.event_type.as_str())
        .bind(&entry.message)
        .bind(data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT timestamp, period_start, event_type, message, data
            FROM stats_logs
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_log).collect()
    }

    async fn purge_logs(&self, before: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM stats_logs WHERE timestamp < ?")
            .bind(to_millis(before))
            .execute(&self.pool)
            .await?
            .rows_affected();

        tracing::info!("Cleaned up {} old log entries", deleted);
        Ok(deleted)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
