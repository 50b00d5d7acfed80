//! Build rows and their work-queue dispatch columns.
//!
//! The queue contract (FIFO order, dispatch tokens, visibility timeout)
//! lives in these statements; `queue::WorkQueue` adds blocking and wakeups
//! on top.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use tracing::debug;

use crate::types::{Build, BuildId, BuildStatus, ErrorKind, ProjectId, TriggerKind};

use super::{from_millis, to_millis, Database, DatabaseError, DatabaseResult};

/// Fields supplied when a build is created
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub project_id: ProjectId,
    pub commit: String,
    pub branch: String,
    pub message: String,
    pub author: String,
    pub pr_number: Option<i64>,
    pub trigger: TriggerKind,
    pub parent_build: Option<BuildId>,
}

impl Database {
    /// Insert a build in `Queued`, immediately visible to the queue
    pub async fn insert_build(&self, new: &NewBuild, now: DateTime<Utc>) -> DatabaseResult<BuildId> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO builds
                (project_id, commit_sha, branch, message, author, pr_number,
                 trigger_kind, status, queued_at, visible_at, parent_build)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?10)
            "#,
            params![
                new.project_id,
                new.commit,
                new.branch,
                new.message,
                new.author,
                new.pr_number,
                new.trigger.as_str(),
                BuildStatus::Queued.as_str(),
                to_millis(now),
                new.parent_build,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Load one build
    pub async fn get_build(&self, id: BuildId) -> DatabaseResult<Build> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_BUILD))?;
        let build = stmt
            .query_row([id], row_to_build)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DatabaseError::NotFound(format!("build {}", id))
                }
                other => DatabaseError::Sqlite(other),
            })?;
        Ok(build)
    }

    /// Pop the oldest visible queued build and bind it to `token`.
    ///
    /// The row stays `Queued`; redelivery is suppressed until `now +
    /// visibility`. Returns `None` when nothing is dispatchable.
    pub async fn try_dequeue(
        &self,
        token: &str,
        now: DateTime<Utc>,
        visibility: std::time::Duration,
    ) -> DatabaseResult<Option<Build>> {
        let conn = self.conn.lock().await;

        let candidate: Option<BuildId> = conn
            .query_row(
                r#"
                SELECT id FROM builds
                WHERE status = 'queued' AND visible_at <= ?1
                ORDER BY id ASC
                LIMIT 1
                "#,
                [to_millis(now)],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        let hidden_until = to_millis(now) + visibility.as_millis() as i64;
        let changed = conn.execute(
            r#"
            UPDATE builds SET dispatch_token = ?1, visible_at = ?2
            WHERE id = ?3 AND status = 'queued' AND visible_at <= ?4
            "#,
            params![token, hidden_until, id, to_millis(now)],
        )?;
        if changed == 0 {
            return Ok(None);
        }

        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_BUILD))?;
        let build = stmt.query_row([id], row_to_build)?;
        debug!(build_id = id, token, "Dispatched build");
        Ok(Some(build))
    }

    /// Acknowledge a delivery; clears the token wherever it is outstanding
    pub async fn ack_dispatch(&self, token: &str) -> DatabaseResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE builds SET dispatch_token = NULL WHERE dispatch_token = ?1",
            [token],
        )?;
        Ok(changed > 0)
    }

    /// Return a delivery to the queue, visible again at `visible_at`
    pub async fn nack_dispatch(
        &self,
        token: &str,
        visible_at: DateTime<Utc>,
    ) -> DatabaseResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            r#"
            UPDATE builds SET dispatch_token = NULL, visible_at = ?1
            WHERE dispatch_token = ?2 AND status = 'queued'
            "#,
            params![to_millis(visible_at), token],
        )?;
        Ok(changed > 0)
    }

    /// Queued -> Running. Returns false if the build was not `Queued`
    /// (e.g. a cancel won the race).
    pub async fn mark_running(&self, id: BuildId, now: DateTime<Utc>) -> DatabaseResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            r#"
            UPDATE builds SET status = 'running', started_at = ?1
            WHERE id = ?2 AND status = 'queued'
            "#,
            params![to_millis(now), id],
        )?;
        Ok(changed > 0)
    }

    /// Running -> terminal. Duration is measured from `started_at`.
    /// Returns false if the build was no longer `Running`.
    pub async fn finish_build(
        &self,
        id: BuildId,
        status: BuildStatus,
        error: Option<&str>,
        error_kind: Option<ErrorKind>,
        now: DateTime<Utc>,
    ) -> DatabaseResult<bool> {
        debug_assert!(status.is_terminal());
        let conn = self.conn.lock().await;

        let started: Option<i64> = conn
            .query_row("SELECT started_at FROM builds WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DatabaseError::NotFound(format!("build {}", id))
                }
                other => DatabaseError::Sqlite(other),
            })?;

        let duration_ms = started.map(|s| (to_millis(now) - s).max(0));

        let changed = conn.execute(
            r#"
            UPDATE builds
            SET status = ?1, finished_at = ?2, duration_ms = ?3,
                error = ?4, error_kind = ?5
            WHERE id = ?6 AND status = 'running'
            "#,
            params![
                status.as_str(),
                to_millis(now),
                duration_ms,
                error,
                error_kind.map(|k| k.as_str()),
                id,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Queued -> Cancelled, pre-dispatch. Returns false if no longer `Queued`.
    pub async fn cancel_queued(&self, id: BuildId, now: DateTime<Utc>) -> DatabaseResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            r#"
            UPDATE builds
            SET status = 'cancelled', finished_at = ?1, error_kind = 'cancelled'
            WHERE id = ?2 AND status = 'queued'
            "#,
            params![to_millis(now), id],
        )?;
        Ok(changed > 0)
    }

    /// Update progress counters while a build runs
    pub async fn update_step_counts(
        &self,
        id: BuildId,
        total: i64,
        completed: i64,
        failed: i64,
    ) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            UPDATE builds SET steps_total = ?1, steps_completed = ?2, steps_failed = ?3
            WHERE id = ?4
            "#,
            params![total, completed, failed, id],
        )?;
        Ok(())
    }

    /// Running builds whose dispatch token's visibility window has lapsed
    /// (executor presumed dead)
    pub async fn running_with_expired_token(
        &self,
        now: DateTime<Utc>,
    ) -> DatabaseResult<Vec<Build>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status = 'running' AND dispatch_token IS NOT NULL AND visible_at <= ?1",
            SELECT_BUILD
        ))?;
        let builds = stmt
            .query_map([to_millis(now)], row_to_build)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(builds)
    }

    /// Claim the one automatic retry allowed for a build.
    ///
    /// Returns true only for the caller that flips the flag, making
    /// concurrent reconcile passes safe.
    pub async fn claim_auto_retry(&self, id: BuildId) -> DatabaseResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE builds SET auto_retried = 1 WHERE id = ?1 AND auto_retried = 0",
            [id],
        )?;
        Ok(changed > 0)
    }

    /// Most recent builds, newest first
    pub async fn recent_builds(&self, limit: usize) -> DatabaseResult<Vec<Build>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{} ORDER BY id DESC LIMIT ?1",
            SELECT_BUILD
        ))?;
        let builds = stmt
            .query_map([limit as i64], row_to_build)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(builds)
    }

    /// Number of builds currently `Running`
    pub async fn running_count(&self) -> DatabaseResult<i64> {
        let conn = self.conn.lock().await;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM builds WHERE status = 'running'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

const SELECT_BUILD: &str = r#"
    SELECT id, project_id, commit_sha, branch, message, author, pr_number,
           trigger_kind, status, queued_at, started_at, finished_at,
           duration_ms, steps_total, steps_completed, steps_failed,
           error, error_kind, parent_build, dispatch_token, auto_retried
    FROM builds
"#;

fn row_to_build(row: &Row<'_>) -> rusqlite::Result<Build> {
    let trigger: String = row.get(7)?;
    let status: String = row.get(8)?;
    let error_kind: Option<String> = row.get(17)?;

    Ok(Build {
        id: row.get(0)?,
        project_id: row.get(1)?,
        commit: row.get(2)?,
        branch: row.get(3)?,
        message: row.get(4)?,
        author: row.get(5)?,
        pr_number: row.get(6)?,
        trigger: TriggerKind::parse(&trigger).unwrap_or(TriggerKind::Manual),
        status: BuildStatus::parse(&status).unwrap_or(BuildStatus::Failed),
        queued_at: from_millis(row.get(9)?),
        started_at: row.get::<_, Option<i64>>(10)?.map(from_millis),
        finished_at: row.get::<_, Option<i64>>(11)?.map(from_millis),
        duration_ms: row.get(12)?,
        steps_total: row.get(13)?,
        steps_completed: row.get(14)?,
        steps_failed: row.get(15)?,
        error: row.get(16)?,
        error_kind: error_kind.as_deref().and_then(ErrorKind::parse),
        parent_build: row.get(18)?,
        dispatch_token: row.get(19)?,
        auto_retried: row.get::<_, i64>(20)? != 0,
    })
}
