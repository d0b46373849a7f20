//! SQLite History Store
//!
//! Durable [`HistoryStore`] with separate reader/writer connections.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::history::{HistoryError, HistoryRecord, HistoryResult, HistoryStore};
use crate::types::Metadata;

/// One row of the analysis run log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRun {
    pub id: i64,
    pub user_id: String,
    pub metadata: Metadata,
}

/// SQLite history store
///
/// All methods take `&self`; the store is `Send + Sync` and is shared as
/// `Arc<SqliteHistoryStore>`.
pub struct SqliteHistoryStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl SqliteHistoryStore {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> HistoryResult<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -16000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Default database path under the platform data directory
    pub fn default_path() -> HistoryResult<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "reverie", "core").ok_or_else(|| {
            HistoryError::Init("Could not determine project directories".to_string())
        })?;

        let data_dir = proj_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;
        // Restrict directory permissions to owner-only on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            let _ = std::fs::set_permissions(data_dir, perms);
        }
        Ok(data_dir.join("reverie.db"))
    }

    /// Open (creating and migrating if needed) the store
    pub fn new(db_path: Option<PathBuf>) -> HistoryResult<Self> {
        let path = match db_path {
            Some(p) => p,
            None => Self::default_path()?,
        };

        let writer_conn = Connection::open(&path)?;

        // Restrict database file permissions to owner-only on Unix
        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&path, perms);
        }

        Self::configure_connection(&writer_conn)?;

        // Apply migrations on writer only
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        tracing::debug!(path = %path.display(), "Opened history store");

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    fn writer(&self) -> HistoryResult<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| HistoryError::Init("Writer lock poisoned".into()))
    }

    fn reader(&self) -> HistoryResult<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| HistoryError::Init("Reader lock poisoned".into()))
    }

    fn parse_timestamp(value: &str, field_name: &str) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("Invalid {} timestamp '{}': {}", field_name, value, e),
                    )),
                )
            })
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<HistoryRecord> {
        let id: String = row.get("id")?;
        let timestamp: String = row.get("timestamp")?;
        let tags_json: String = row.get("tags")?;
        let tags = serde_json::from_str(&tags_json).map_err(|e| {
            tracing::warn!(id = %id, error = %e, "Corrupt tags column");
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(HistoryRecord {
            id,
            content: row.get("content")?,
            timestamp: Self::parse_timestamp(&timestamp, "timestamp")?,
            tags,
        })
    }

    /// Insert records for a user. Records are immutable: an ID that already
    /// exists for the user is skipped. Returns the number inserted.
    pub fn append_records(&self, user_id: &str, records: &[HistoryRecord]) -> HistoryResult<usize> {
        let now = Utc::now().to_rfc3339();
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO history_records (user_id, id, content, timestamp, tags, imported_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for record in records {
                let tags_json = serde_json::to_string(&record.tags)?;
                inserted += stmt.execute(params![
                    user_id,
                    record.id,
                    record.content,
                    record.timestamp.to_rfc3339(),
                    tags_json,
                    now,
                ])?;
            }
        }
        tx.commit()?;

        tracing::info!(
            user_id,
            inserted,
            skipped = records.len() - inserted,
            "Imported history records"
        );
        Ok(inserted)
    }

    /// All records for a user, oldest first
    pub fn records_for(&self, user_id: &str) -> HistoryResult<Vec<HistoryRecord>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, content, timestamp, tags FROM history_records
             WHERE user_id = ?1 ORDER BY timestamp ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![user_id], Self::row_to_record)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn count_records(&self, user_id: &str) -> HistoryResult<usize> {
        let reader = self.reader()?;
        let count: i64 = reader.query_row(
            "SELECT COUNT(*) FROM history_records WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Append one row to the analysis run log
    pub fn insert_run(&self, user_id: &str, metadata: &Metadata) -> HistoryResult<i64> {
        let metadata_json = serde_json::to_string(metadata)?;
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO analysis_runs (
                user_id, completed_at, model, duration_ms, cache_hit, retry_count, degraded, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user_id,
                metadata.completed_at.to_rfc3339(),
                metadata.model,
                metadata.duration_ms as i64,
                metadata.cache_hit.to_string(),
                metadata.retry_count,
                metadata.degraded,
                metadata_json,
            ],
        )?;
        Ok(writer.last_insert_rowid())
    }

    /// Most recent analysis runs, newest first, optionally for one user
    pub fn recent_runs(&self, user_id: Option<&str>, limit: usize) -> HistoryResult<Vec<AnalysisRun>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, user_id, metadata FROM analysis_runs
             WHERE ?1 IS NULL OR user_id = ?1
             ORDER BY completed_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (id, user_id, metadata_json) = row?;
            result.push(AnalysisRun {
                id,
                user_id,
                metadata: serde_json::from_str(&metadata_json)?,
            });
        }
        Ok(result)
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn load_records(&self, user_id: &str) -> HistoryResult<Vec<HistoryRecord>> {
        self.records_for(user_id)
    }

    async fn record_analysis_metadata(&self, user_id: &str, metadata: &Metadata) -> HistoryResult<()> {
        self.insert_run(user_id, metadata).map(|_| ())
    }
}
