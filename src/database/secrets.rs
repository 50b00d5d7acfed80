//! Secret ciphertext persistence.
//!
//! Only ciphertext ever reaches this table; encryption and decryption stay
//! in the vault.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::types::ProjectId;

use super::{to_millis, Database, DatabaseResult};

impl Database {
    /// Store ciphertext under `(project, name)`, replacing on collision
    pub async fn put_secret(
        &self,
        project_id: ProjectId,
        name: &str,
        ciphertext: &str,
        now: DateTime<Utc>,
    ) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO secrets (project_id, name, ciphertext, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![project_id, name, ciphertext, to_millis(now)],
        )?;
        Ok(())
    }

    /// Remove a secret; returns whether it existed
    pub async fn delete_secret(&self, project_id: ProjectId, name: &str) -> DatabaseResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "DELETE FROM secrets WHERE project_id = ?1 AND name = ?2",
            params![project_id, name],
        )?;
        Ok(changed > 0)
    }

    /// All `(name, ciphertext)` pairs for a project
    pub async fn secrets_for_project(
        &self,
        project_id: ProjectId,
    ) -> DatabaseResult<Vec<(String, String)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT name, ciphertext FROM secrets WHERE project_id = ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map([project_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_overwrites_on_collision() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.put_secret(1, "API_KEY", "cipher-a", now).await.unwrap();
        db.put_secret(1, "API_KEY", "cipher-b", now).await.unwrap();

        let secrets = db.secrets_for_project(1).await.unwrap();
        assert_eq!(secrets, vec![("API_KEY".to_string(), "cipher-b".to_string())]);
    }

    #[tokio::test]
    async fn test_secrets_scoped_to_project() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.put_secret(1, "A", "c1", now).await.unwrap();
        db.put_secret(2, "B", "c2", now).await.unwrap();

        assert_eq!(db.secrets_for_project(1).await.unwrap().len(), 1);
        assert_eq!(db.secrets_for_project(2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.put_secret(1, "A", "c", now).await.unwrap();
        assert!(db.delete_secret(1, "A").await.unwrap());
        assert!(!db.delete_secret(1, "A").await.unwrap());
    }
}
