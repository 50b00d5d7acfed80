//! Durable state persistence.
//!
//! One SQLite database holds projects, builds (including their work-queue
//! dispatch columns), secrets, log entries and artifacts. The connection is
//! shared behind an async mutex; statements are short and serialised.

mod artifacts;
mod builds;
mod logs;
mod projects;
mod secrets;

pub use artifacts::ArtifactRow;
pub use builds::NewBuild;

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, Result as SqliteResult};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Main database wrapper
pub struct Database {
    pub(crate) conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        Self::init_tables(&conn)?;

        info!("Database opened at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Initialize database tables
    fn init_tables(conn: &Connection) -> SqliteResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repository TEXT NOT NULL,
                default_branch TEXT NOT NULL DEFAULT 'main',
                branch_filter TEXT,
                build_pull_requests INTEGER NOT NULL DEFAULT 0,
                max_duration_secs INTEGER NOT NULL DEFAULT 0,
                image TEXT,
                profile TEXT,
                required_secrets TEXT NOT NULL DEFAULT '[]',
                phases TEXT NOT NULL DEFAULT '[]',
                allow_host_engine INTEGER NOT NULL DEFAULT 0,
                notify_on_failure INTEGER NOT NULL DEFAULT 0,
                owner_id INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS builds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id),
                commit_sha TEXT NOT NULL,
                branch TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                author TEXT NOT NULL DEFAULT '',
                pr_number INTEGER,
                trigger_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                queued_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                duration_ms INTEGER,
                steps_total INTEGER NOT NULL DEFAULT 0,
                steps_completed INTEGER NOT NULL DEFAULT 0,
                steps_failed INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                error_kind TEXT,
                parent_build INTEGER,
                dispatch_token TEXT,
                visible_at INTEGER NOT NULL DEFAULT 0,
                auto_retried INTEGER NOT NULL DEFAULT 0
            );

            -- Queue pop scans queued rows in insertion order
            CREATE INDEX IF NOT EXISTS idx_builds_queue
                ON builds(status, visible_at, id);

            CREATE INDEX IF NOT EXISTS idx_builds_project
                ON builds(project_id, id);

            CREATE TABLE IF NOT EXISTS secrets (
                project_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                ciphertext TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (project_id, name)
            );

            CREATE TABLE IF NOT EXISTS log_entries (
                build_id INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                kind TEXT NOT NULL,
                step_name TEXT,
                message TEXT NOT NULL,
                at INTEGER NOT NULL,
                PRIMARY KEY (build_id, sequence)
            );

            CREATE INDEX IF NOT EXISTS idx_log_entries_at
                ON log_entries(at);

            CREATE TABLE IF NOT EXISTS artifacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                build_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                storage_path TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_artifacts_expiry
                ON artifacts(expires_at);

            CREATE INDEX IF NOT EXISTS idx_artifacts_build
                ON artifacts(build_id);
            "#,
        )?;

        Ok(())
    }
}

/// Persisted timestamps are unix milliseconds
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        drop(db);
    }

    #[test]
    fn test_millis_round_trip() {
        let now = Utc::now();
        let rt = from_millis(to_millis(now));
        assert_eq!(rt.timestamp_millis(), now.timestamp_millis());
    }
}
