//! Log entry persistence.
//!
//! Sequence numbers are assigned at insertion: each entry gets
//! `max(sequence) + 1` for its build, computed and written under the
//! connection lock so the per-build sequence stays dense.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::types::{BuildId, LogEntry, LogKind};

use super::{from_millis, to_millis, Database, DatabaseResult};

impl Database {
    /// Append a log entry; returns the assigned sequence number
    pub async fn append_log(
        &self,
        build_id: BuildId,
        kind: LogKind,
        step_name: Option<&str>,
        message: &str,
        at: DateTime<Utc>,
    ) -> DatabaseResult<i64> {
        let conn = self.conn.lock().await;

        let next: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM log_entries WHERE build_id = ?1",
            [build_id],
            |row| row.get(0),
        )?;

        conn.execute(
            r#"
            INSERT INTO log_entries (build_id, sequence, kind, step_name, message, at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![build_id, next, kind.as_str(), step_name, message, to_millis(at)],
        )?;

        Ok(next)
    }

    /// Entries with `sequence > after`, in sequence order
    pub async fn logs_after(
        &self,
        build_id: BuildId,
        after: i64,
    ) -> DatabaseResult<Vec<LogEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT build_id, sequence, kind, step_name, message, at
            FROM log_entries
            WHERE build_id = ?1 AND sequence > ?2
            ORDER BY sequence ASC
            "#,
        )?;
        let entries = stmt
            .query_map(params![build_id, after], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Highest assigned sequence for a build (0 when empty)
    pub async fn max_log_sequence(&self, build_id: BuildId) -> DatabaseResult<i64> {
        let conn = self.conn.lock().await;
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM log_entries WHERE build_id = ?1",
            [build_id],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Delete entries older than `cutoff`; returns the number removed
    pub async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> DatabaseResult<usize> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM log_entries WHERE at < ?1",
            [to_millis(cutoff)],
        )?;
        Ok(removed)
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let kind: String = row.get(2)?;
    Ok(LogEntry {
        build_id: row.get(0)?,
        sequence: row.get(1)?,
        kind: LogKind::parse(&kind).unwrap_or(LogKind::Output),
        step_name: row.get(3)?,
        message: row.get(4)?,
        at: from_millis(row.get(5)?),
    })
}
