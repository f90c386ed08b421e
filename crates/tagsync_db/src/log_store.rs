//! Per-file load log and per-invocation tag audit log.
//!
//! The newest file log row for a file is the coordination point between
//! concurrent invocations: a `processing` row with a live lease means some
//! other process is loading that file.

use async_trait::async_trait;
use sqlx::Row;

use crate::error::{DbError, Result};
use crate::pool::{LogPool, LogRow, TIMESTAMP_TYPE};
use crate::sql::Ident;
use crate::types::{FileLoadRecord, LoadClaim, LoadOutcome, LoadStatus, TagLogRecord};

/// Durable log of file load attempts and tag sync invocations.
///
/// Rows are keyed by `(file_name, remote_timestamp)`, so each remote version
/// of a file keeps its own history row.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Insert a new row; fails if the key already exists.
    async fn append(&self, record: &FileLoadRecord) -> Result<()>;

    /// Insert or re-open the row for this remote version as `processing`.
    async fn start_or_update(&self, claim: &LoadClaim) -> Result<()>;

    /// Record the terminal status, end time and error of an attempt.
    async fn finish(&self, outcome: &LoadOutcome) -> Result<()>;

    /// Newest row by (remote_timestamp, start_time), or the seed record.
    async fn latest(&self, file_name: &str) -> Result<FileLoadRecord>;

    async fn append_tag_log(&self, record: &TagLogRecord) -> Result<()>;
}

/// Table names used by the SQL stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTables {
    pub file_log: Ident,
    pub tag_log: Ident,
    pub sync_rule: Ident,
    pub primary_key: Ident,
    pub derived_rule: Ident,
}

impl StoreTables {
    pub fn new(
        file_log: &str,
        tag_log: &str,
        sync_rule: &str,
        primary_key: &str,
        derived_rule: &str,
    ) -> Result<Self> {
        Ok(Self {
            file_log: Ident::parse(file_log)?,
            tag_log: Ident::parse(tag_log)?,
            sync_rule: Ident::parse(sync_rule)?,
            primary_key: Ident::parse(primary_key)?,
            derived_rule: Ident::parse(derived_rule)?,
        })
    }
}

impl Default for StoreTables {
    fn default() -> Self {
        Self {
            file_log: Ident::from_static("log_file"),
            tag_log: Ident::from_static("log_tag"),
            sync_rule: Ident::from_static("sync_rule"),
            primary_key: Ident::from_static("pk_table"),
            derived_rule: Ident::from_static("derived_rule"),
        }
    }
}

/// [`LogStore`] over the log/config database.
#[derive(Debug, Clone)]
pub struct SqlLogStore {
    pool: LogPool,
    tables: StoreTables,
}

impl SqlLogStore {
    pub fn new(pool: LogPool, tables: StoreTables) -> Self {
        Self { pool, tables }
    }

    pub fn pool(&self) -> &LogPool {
        &self.pool
    }

    /// Create the log tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        let ts = TIMESTAMP_TYPE;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {file_log} (
                file_name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_hdfs_time {ts} NOT NULL,
                start_time {ts} NOT NULL,
                end_time {ts},
                status TEXT NOT NULL,
                error_msg TEXT,
                staging_schema TEXT,
                staging_table TEXT,
                lease_expires_at {ts},
                PRIMARY KEY (file_name, file_hdfs_time)
            )
            "#,
            file_log = self.tables.file_log.quoted(),
            ts = ts,
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {tag_log} (
                request_id TEXT,
                sync_task_id TEXT NOT NULL,
                tag_name_en TEXT NOT NULL,
                file_name TEXT,
                file_hdfs_time {ts},
                start_time {ts} NOT NULL,
                end_time {ts} NOT NULL,
                status TEXT NOT NULL,
                error_msg TEXT
            )
            "#,
            tag_log = self.tables.tag_log.quoted(),
            ts = ts,
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Every row for a file, newest first.
    pub async fn history(&self, file_name: &str) -> Result<Vec<FileLoadRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT file_name, file_path, file_hdfs_time, start_time, end_time, status,
                   error_msg, staging_schema, staging_table, lease_expires_at
            FROM {}
            WHERE file_name = $1
            ORDER BY file_hdfs_time DESC, start_time DESC
            "#,
            self.tables.file_log.quoted()
        ))
        .bind(file_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Tag log rows for a task, oldest first.
    pub async fn tag_history(&self, task_id: &str) -> Result<Vec<TagLogRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT request_id, sync_task_id, tag_name_en, file_name, file_hdfs_time,
                   start_time, end_time, status, error_msg
            FROM {}
            WHERE sync_task_id = $1
            ORDER BY start_time ASC
            "#,
            self.tables.tag_log.quoted()
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<TagLogRecord> {
                Ok(TagLogRecord {
                    request_id: row.try_get("request_id")?,
                    task_id: row.try_get("sync_task_id")?,
                    tag_name: row.try_get("tag_name_en")?,
                    file_name: row.try_get("file_name")?,
                    remote_timestamp: row.try_get("file_hdfs_time")?,
                    start_time: row.try_get("start_time")?,
                    end_time: row.try_get("end_time")?,
                    status: parse_status(row.try_get("status")?)?,
                    error_msg: row.try_get("error_msg")?,
                })
            })
            .collect()
    }
}

fn parse_status(raw: String) -> Result<LoadStatus> {
    raw.parse().map_err(DbError::conversion)
}

fn record_from_row(row: &LogRow) -> Result<FileLoadRecord> {
    Ok(FileLoadRecord {
        file_name: row.try_get("file_name")?,
        file_path: row.try_get("file_path")?,
        remote_timestamp: row.try_get("file_hdfs_time")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        status: parse_status(row.try_get("status")?)?,
        error_msg: row.try_get("error_msg")?,
        staging_schema: row.try_get("staging_schema")?,
        staging_table: row.try_get("staging_table")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
    })
}

#[async_trait]
impl LogStore for SqlLogStore {
    async fn append(&self, record: &FileLoadRecord) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (file_name, file_path, file_hdfs_time, start_time, end_time, status,
                            error_msg, staging_schema, staging_table, lease_expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
            self.tables.file_log.quoted()
        ))
        .bind(&record.file_name)
        .bind(&record.file_path)
        .bind(record.remote_timestamp)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(record.status.as_str())
        .bind(&record.error_msg)
        .bind(&record.staging_schema)
        .bind(&record.staging_table)
        .bind(record.lease_expires_at)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if matches!(&err, sqlx::Error::Database(db) if db.is_unique_violation()) {
                DbError::duplicate(format!(
                    "load row for {} @ {} already exists",
                    record.file_name, record.remote_timestamp
                ))
            } else {
                DbError::from(err)
            }
        })?;
        Ok(())
    }

    async fn start_or_update(&self, claim: &LoadClaim) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (file_name, file_path, file_hdfs_time, start_time, status,
                            staging_schema, staging_table, lease_expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (file_name, file_hdfs_time) DO UPDATE SET
                start_time = excluded.start_time,
                status = excluded.status,
                end_time = NULL,
                error_msg = NULL,
                staging_schema = excluded.staging_schema,
                staging_table = excluded.staging_table,
                lease_expires_at = excluded.lease_expires_at
            "#,
            self.tables.file_log.quoted()
        ))
        .bind(&claim.file_name)
        .bind(&claim.file_path)
        .bind(claim.remote_timestamp)
        .bind(claim.start_time)
        .bind(LoadStatus::Processing.as_str())
        .bind(&claim.staging_schema)
        .bind(&claim.staging_table)
        .bind(claim.lease_expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish(&self, outcome: &LoadOutcome) -> Result<()> {
        if outcome.status == LoadStatus::Processing {
            return Err(DbError::invalid_state(format!(
                "finish for {} requires a terminal status",
                outcome.file_name
            )));
        }
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (file_name, file_path, file_hdfs_time, start_time, end_time,
                            status, error_msg)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (file_name, file_hdfs_time) DO UPDATE SET
                end_time = excluded.end_time,
                status = excluded.status,
                error_msg = excluded.error_msg,
                lease_expires_at = NULL
            "#,
            self.tables.file_log.quoted()
        ))
        .bind(&outcome.file_name)
        .bind(&outcome.file_path)
        .bind(outcome.remote_timestamp)
        .bind(outcome.start_time)
        .bind(outcome.end_time)
        .bind(outcome.status.as_str())
        .bind(&outcome.error_msg)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest(&self, file_name: &str) -> Result<FileLoadRecord> {
        let row = sqlx::query(&format!(
            r#"
            SELECT file_name, file_path, file_hdfs_time, start_time, end_time, status,
                   error_msg, staging_schema, staging_table, lease_expires_at
            FROM {}
            WHERE file_name = $1
            ORDER BY file_hdfs_time DESC, start_time DESC
            LIMIT 1
            "#,
            self.tables.file_log.quoted()
        ))
        .bind(file_name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => record_from_row(&row),
            None => Ok(FileLoadRecord::seed(file_name)),
        }
    }

    async fn append_tag_log(&self, record: &TagLogRecord) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (request_id, sync_task_id, tag_name_en, file_name, file_hdfs_time,
                            start_time, end_time, status, error_msg)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
            self.tables.tag_log.quoted()
        ))
        .bind(&record.request_id)
        .bind(&record.task_id)
        .bind(&record.tag_name)
        .bind(&record.file_name)
        .bind(record.remote_timestamp)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(record.status.as_str())
        .bind(&record.error_msg)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::pool::connect_log_pool;
    use chrono::{Duration, NaiveDateTime};

    fn ts(raw: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(raw, crate::types::TIMESTAMP_FORMAT).unwrap()
    }

    async fn store() -> SqlLogStore {
        let pool = connect_log_pool("sqlite::memory:", 1).await.unwrap();
        let store = SqlLogStore::new(pool, StoreTables::default());
        store.ensure_schema().await.unwrap();
        store
    }

    fn claim(remote: &str, start: &str) -> LoadClaim {
        LoadClaim {
            file_name: "sales.csv".into(),
            file_path: "/data/sales.csv".into(),
            remote_timestamp: ts(remote),
            start_time: ts(start),
            lease_expires_at: ts(start) + Duration::hours(1),
            staging_schema: "tmp".into(),
            staging_table: "sales".into(),
        }
    }

    fn outcome(remote: &str, status: LoadStatus, error: Option<&str>) -> LoadOutcome {
        LoadOutcome {
            file_name: "sales.csv".into(),
            file_path: "/data/sales.csv".into(),
            remote_timestamp: ts(remote),
            start_time: ts(remote),
            end_time: ts(remote) + Duration::minutes(5),
            status,
            error_msg: error.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_latest_returns_seed_for_unknown_file() {
        let store = store().await;
        let latest = store.latest("nothing.csv").await.unwrap();
        assert!(latest.is_seed());
        assert_eq!(latest.status, LoadStatus::Fail);
    }

    #[tokio::test]
    async fn test_start_then_finish() {
        let store = store().await;
        store
            .start_or_update(&claim("2024-05-01 10:00:00", "2024-05-02 08:00:00"))
            .await
            .unwrap();

        let latest = store.latest("sales.csv").await.unwrap();
        assert_eq!(latest.status, LoadStatus::Processing);
        assert_eq!(latest.staging_table.as_deref(), Some("sales"));
        assert!(latest.lease_expires_at.is_some());

        store
            .finish(&outcome("2024-05-01 10:00:00", LoadStatus::Success, None))
            .await
            .unwrap();
        let latest = store.latest("sales.csv").await.unwrap();
        assert_eq!(latest.status, LoadStatus::Success);
        assert!(latest.end_time.is_some());
        assert!(latest.lease_expires_at.is_none());
        // finish keeps the claim's start time and staging columns
        assert_eq!(latest.start_time, ts("2024-05-02 08:00:00"));
        assert_eq!(latest.staging_schema.as_deref(), Some("tmp"));
    }

    #[tokio::test]
    async fn test_start_or_update_reopens_failed_row() {
        let store = store().await;
        store
            .finish(&outcome("2024-05-01 10:00:00", LoadStatus::Fail, Some("transfer failed")))
            .await
            .unwrap();
        store
            .start_or_update(&claim("2024-05-01 10:00:00", "2024-05-03 09:00:00"))
            .await
            .unwrap();

        let history = store.history("sales.csv").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, LoadStatus::Processing);
        assert_eq!(history[0].error_msg, None);
        assert_eq!(history[0].start_time, ts("2024-05-03 09:00:00"));
    }

    #[tokio::test]
    async fn test_latest_orders_by_remote_timestamp_then_start() {
        let store = store().await;
        store
            .append(&claim("2024-05-01 10:00:00", "2024-05-04 00:00:00").to_record())
            .await
            .unwrap();
        store
            .append(&claim("2024-05-02 10:00:00", "2024-05-02 11:00:00").to_record())
            .await
            .unwrap();

        let latest = store.latest("sales.csv").await.unwrap();
        assert_eq!(latest.remote_timestamp, ts("2024-05-02 10:00:00"));
        assert_eq!(store.history("sales.csv").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_append_rejects_duplicate_version() {
        let store = store().await;
        let record = claim("2024-05-01 10:00:00", "2024-05-01 11:00:00").to_record();
        store.append(&record).await.unwrap();
        let err = store.append(&record).await.unwrap_err();
        assert!(err.is_duplicate(), "{err}");
    }

    #[tokio::test]
    async fn test_finish_rejects_processing() {
        let store = store().await;
        let result = store
            .finish(&outcome("2024-05-01 10:00:00", LoadStatus::Processing, None))
            .await;
        assert!(matches!(result, Err(DbError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_tag_log_roundtrip() {
        let store = store().await;
        let record = TagLogRecord {
            request_id: Some("req-1".into()),
            task_id: "7".into(),
            tag_name: "amt".into(),
            file_name: Some("sales.csv".into()),
            remote_timestamp: Some(ts("2024-05-01 10:00:00")),
            start_time: ts("2024-05-02 08:00:00"),
            end_time: ts("2024-05-02 08:01:00"),
            status: LoadStatus::Success,
            error_msg: None,
        };
        store.append_tag_log(&record).await.unwrap();
        assert_eq!(store.tag_history("7").await.unwrap(), vec![record]);
    }
}
