//! Project persistence

use rusqlite::{params, Row};

use crate::types::{Phase, Project, ProjectId};

use super::{Database, DatabaseError, DatabaseResult};

impl Database {
    /// Insert a project; returns its id
    pub async fn insert_project(&self, project: &Project) -> DatabaseResult<ProjectId> {
        let required = serde_json::to_string(&project.required_secrets)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let phases = serde_json::to_string(&project.phases)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO projects
                (repository, default_branch, branch_filter, build_pull_requests,
                 max_duration_secs, image, profile, required_secrets, phases,
                 allow_host_engine, notify_on_failure, owner_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                project.repository,
                project.default_branch,
                project.branch_filter,
                project.build_pull_requests as i64,
                project.max_duration_secs as i64,
                project.image,
                project.profile,
                required,
                phases,
                project.allow_host_engine as i64,
                project.notify_on_failure as i64,
                project.owner_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Load one project
    pub async fn get_project(&self, id: ProjectId) -> DatabaseResult<Project> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, repository, default_branch, branch_filter, build_pull_requests,
                   max_duration_secs, image, profile, required_secrets, phases,
                   allow_host_engine, notify_on_failure, owner_id
            FROM projects WHERE id = ?1
            "#,
        )?;
        stmt.query_row([id], row_to_project).map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                DatabaseError::NotFound(format!("project {}", id))
            }
            other => DatabaseError::Sqlite(other),
        })?
    }
}

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<DatabaseResult<Project>> {
    let required_json: String = row.get(8)?;
    let phases_json: String = row.get(9)?;

    let required_secrets: Result<Vec<String>, _> = serde_json::from_str(&required_json);
    let phases: Result<Vec<Phase>, _> = serde_json::from_str(&phases_json);

    Ok(match (required_secrets, phases) {
        (Ok(required_secrets), Ok(phases)) => Ok(Project {
            id: row.get(0)?,
            repository: row.get(1)?,
            default_branch: row.get(2)?,
            branch_filter: row.get(3)?,
            build_pull_requests: row.get::<_, i64>(4)? != 0,
            max_duration_secs: row.get::<_, i64>(5)? as u64,
            image: row.get(6)?,
            profile: row.get(7)?,
            required_secrets,
            phases,
            allow_host_engine: row.get::<_, i64>(10)? != 0,
            notify_on_failure: row.get::<_, i64>(11)? != 0,
            owner_id: row.get(12)?,
        }),
        (Err(e), _) | (_, Err(e)) => Err(DatabaseError::Serialization(e.to_string())),
    })
}
