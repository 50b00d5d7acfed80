//! Artifact row persistence

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::types::{Artifact, BuildId};

use super::{from_millis, to_millis, Database, DatabaseResult};

/// An artifact row together with its database id (used by the sweeper)
#[derive(Debug, Clone)]
pub struct ArtifactRow {
    pub id: i64,
    pub artifact: Artifact,
}

impl Database {
    /// Record an artifact produced by a build
    pub async fn insert_artifact(&self, artifact: &Artifact) -> DatabaseResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO artifacts (build_id, name, storage_path, size_bytes, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                artifact.build_id,
                artifact.name,
                artifact.storage_path,
                artifact.size_bytes,
                to_millis(artifact.created_at),
                to_millis(artifact.expires_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Artifacts for one build
    pub async fn artifacts_for_build(&self, build_id: BuildId) -> DatabaseResult<Vec<Artifact>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("{} WHERE build_id = ?1 ORDER BY id", SELECT_ARTIFACT))?;
        let artifacts = stmt
            .query_map([build_id], |row| row_to_artifact(row).map(|r| r.artifact))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(artifacts)
    }

    /// Artifacts whose expiry has passed
    pub async fn expired_artifacts(&self, now: DateTime<Utc>) -> DatabaseResult<Vec<ArtifactRow>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare(&format!("{} WHERE expires_at <= ?1 ORDER BY id", SELECT_ARTIFACT))?;
        let artifacts = stmt
            .query_map([to_millis(now)], row_to_artifact)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(artifacts)
    }

    /// Remove one artifact row
    pub async fn delete_artifact(&self, id: i64) -> DatabaseResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute("DELETE FROM artifacts WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }
}

const SELECT_ARTIFACT: &str = r#"
    SELECT id, build_id, name, storage_path, size_bytes, created_at, expires_at
    FROM artifacts
"#;

fn row_to_artifact(row: &Row<'_>) -> rusqlite::Result<ArtifactRow> {
    Ok(ArtifactRow {
        id: row.get(0)?,
        artifact: Artifact {
            build_id: row.get(1)?,
            name: row.get(2)?,
            storage_path: row.get(3)?,
            size_bytes: row.get(4)?,
            created_at: from_millis(row.get(5)?),
            expires_at: from_millis(row.get(6)?),
        },
    })
}
