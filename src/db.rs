use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tracing::info;

use crate::backup::{BackupError, Result};

// Database connection pool type
pub type DbPool = Pool<Sqlite>;

/// Initialize the database, running migrations if necessary
pub async fn init_db(db_url: &str) -> Result<DbPool> {
    // Create database if it doesn't exist
    if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
        Sqlite::create_database(db_url).await?;
    }

    // Set up connection options
    let options = SqliteConnectOptions::from_str(db_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    // A single writer is all this process ever needs
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("Backup log database initialized at {}", db_url);
    Ok(pool)
}

/// Outcome recorded for a backup attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Success,
    Failure,
    Skipped,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Success => "success",
            BackupStatus::Failure => "failure",
            BackupStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(BackupStatus::Success),
            "failure" => Ok(BackupStatus::Failure),
            "skipped" => Ok(BackupStatus::Skipped),
            other => Err(BackupError::Store(format!("unknown backup status '{}'", other))),
        }
    }
}

// Backup log row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Row id, assigned by the store on insert
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub backup_name: String,
    pub status: BackupStatus,
    pub message: String,
}

impl BackupRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        backup_name: impl Into<String>,
        status: BackupStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            timestamp,
            backup_name: backup_name.into(),
            status,
            message: message.into(),
        }
    }
}

// Implement FromRow for BackupRecord to allow for conversion from database rows
impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for BackupRecord {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(BackupRecord {
            id: Some(row.try_get("id")?),
            timestamp: row.try_get("timestamp")?,
            backup_name: row.try_get("backup_name")?,
            status: status.parse().map_err(|e: BackupError| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: Box::new(e),
            })?,
            message: row.try_get("message")?,
        })
    }
}

/// Append-only log of backup attempts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Append a record, returning its row id
    async fn insert(&self, record: &BackupRecord) -> Result<i64>;

    /// Timestamp of the most recent successful backup, if any
    async fn latest_success(&self) -> Result<Option<DateTime<Utc>>>;

    /// Most recent records first
    async fn recent(&self, limit: u32) -> Result<Vec<BackupRecord>>;
}

/// BackupStore backed by the `backups` SQLite table
#[derive(Clone)]
pub struct SqliteBackupStore {
    pool: DbPool,
}

impl SqliteBackupStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BackupStore for SqliteBackupStore {
    async fn insert(&self, record: &BackupRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO backups (timestamp, backup_name, status, message)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(record.timestamp)
        .bind(&record.backup_name)
        .bind(record.status.as_str())
        .bind(&record.message)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn latest_success(&self) -> Result<Option<DateTime<Utc>>> {
        let timestamp = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT timestamp
            FROM backups
            WHERE status = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(BackupStatus::Success.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(timestamp)
    }

    async fn recent(&self, limit: u32) -> Result<Vec<BackupRecord>> {
        let records = sqlx::query_as::<_, BackupRecord>(
            r#"
            SELECT id, timestamp, backup_name, status, message
            FROM backups
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    /// In-memory store with the production schema
    pub(crate) async fn memory_store() -> SqliteBackupStore {
        // Every connection to :memory: is its own database, so keep exactly one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqliteBackupStore::new(pool)
    }

    #[tokio::test]
    async fn test_latest_success_empty() {
        let store = memory_store().await;
        assert_eq!(store.latest_success().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_latest_success_ignores_failures_and_skips() {
        let store = memory_store().await;
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap();

        store
            .insert(&BackupRecord::new(base, "backup_a_20250601_130000.zip", BackupStatus::Success, "ok"))
            .await
            .unwrap();
        store
            .insert(&BackupRecord::new(
                base + Duration::days(3),
                "backup_a_20250604_130000.zip",
                BackupStatus::Failure,
                "network down",
            ))
            .await
            .unwrap();
        store
            .insert(&BackupRecord::new(base + Duration::days(4), "", BackupStatus::Skipped, "not due"))
            .await
            .unwrap();

        assert_eq!(store.latest_success().await.unwrap(), Some(base));
    }

    #[tokio::test]
    async fn test_recent_is_newest_first() {
        let store = memory_store().await;
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap();

        for day in [2, 0, 1] {
            store
                .insert(&BackupRecord::new(
                    base + Duration::days(day),
                    format!("backup_{}", day),
                    BackupStatus::Success,
                    "ok",
                ))
                .await
                .unwrap();
        }

        let records = store.recent(2).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].backup_name, "backup_2");
        assert_eq!(records[0].timestamp, base + Duration::days(2));
        assert_eq!(records[0].status, BackupStatus::Success);
        assert!(records[0].id.is_some());
        assert_eq!(records[1].backup_name, "backup_1");
    }

    #[test]
    fn test_status_text_round_trip() {
        for status in [BackupStatus::Success, BackupStatus::Failure, BackupStatus::Skipped] {
            assert_eq!(status.as_str().parse::<BackupStatus>().unwrap(), status);
        }
        assert!("Success".parse::<BackupStatus>().is_err());
    }
}
