//! Tally catalog persistence.
//!
//! An async API around SQLite (sqlx) holding the records the query and report
//! pipeline reads and writes: data source credentials (secret already
//! encrypted by the caller), stored queries, report schedules and generated
//! reports. Timestamps are stored as fixed-width RFC 3339 UTC strings so the
//! due-schedule scan can compare them lexically.

mod catalog;
mod reporting;

use std::{path::Path, str::FromStr, time::Duration};

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use thiserror::Error;

pub use catalog::{DataSourceChanges, NewDataSource, NewQuery, QueryChanges};
pub use reporting::{NewReport, NewSchedule, ScheduleChanges};

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Primary entry point to the persistence layer.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes (or creates) a connection pool to the SQLite database located at
    /// the given URL (e.g. `sqlite:///var/lib/tally/catalog.db`).
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Connects to a file path via `sqlite://` scheme.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Errors returned by the database layer that callers branch on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },
}

pub(crate) fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

pub(crate) fn parse_optional_datetime(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.map(parse_datetime).transpose()
}

/// Stored data source connection details. `encrypted_secret` is either empty or
/// a vault ciphertext; plaintext never reaches this struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    /// Engine kind as stored. Kept as free text so an unknown kind reaches the
    /// connection resolver and fails there.
    pub engine: String,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub username: String,
    pub encrypted_secret: String,
    pub description: String,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stored SQL statement bound to one data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: i64,
    pub user_id: i64,
    pub data_source_id: i64,
    pub name: String,
    pub sql_text: String,
    pub description: String,
    pub is_public: bool,
    pub exec_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRecord {
    pub id: i64,
    pub user_id: i64,
    pub owner_is_admin: bool,
    pub name: String,
    pub report_type: ReportType,
    pub description: String,
    pub query_ids: Vec<i64>,
    pub chart_ids: Vec<i64>,
    pub template_ids: Vec<i64>,
    pub cron_pattern: String,
    pub active: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Generated report row. `content` is only loaded by [`Database::fetch_report`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRecord {
    pub id: i64,
    pub user_id: i64,
    pub schedule_id: Option<i64>,
    pub name: String,
    pub report_type: ReportType,
    pub generated_at: DateTime<Utc>,
    pub status: ReportStatus,
    pub error: Option<String>,
    pub content: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Informational cadence of a schedule. Firing times come from the cron pattern.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    Daily,
    Weekly,
    Monthly,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::Daily => "daily",
            ReportType::Weekly => "weekly",
            ReportType::Monthly => "monthly",
        }
    }
}

impl FromStr for ReportType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "daily" => Ok(ReportType::Daily),
            "weekly" => Ok(ReportType::Weekly),
            "monthly" => Ok(ReportType::Monthly),
            other => Err(anyhow!("unknown report type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Success,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Success => "success",
            ReportStatus::Failed => "failed",
        }
    }
}

impl FromStr for ReportStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ReportStatus::Pending),
            "success" => Ok(ReportStatus::Success),
            "failed" => Ok(ReportStatus::Failed),
            other => Err(anyhow!("unknown report status: {}", other)),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;
    use tempfile::TempDir;

    pub async fn setup_db() -> (Database, TempDir) {
        let temp = TempDir::new().unwrap();
        let db = Database::connect_file(&temp.path().join("catalog.sqlite"))
            .await
            .unwrap();
        (db, temp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_lexically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 9, 23, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        assert!(encode_timestamp(early) < encode_timestamp(late));
        assert_eq!(encode_timestamp(late).len(), encode_timestamp(early).len());
        assert_eq!(parse_datetime(encode_timestamp(late)).unwrap(), late);
    }

    #[test]
    fn enum_strings_roundtrip() {
        for kind in [ReportType::Daily, ReportType::Weekly, ReportType::Monthly] {
            assert_eq!(ReportType::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(ReportStatus::from_str("done").is_err());
    }
}
