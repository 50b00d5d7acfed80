//! Secret vault.
//!
//! Stores per-project secrets as ciphertext and decrypts them only at
//! dispatch time, immediately before container provisioning. Plaintext
//! never reaches the database, the logs, or any persisted payload, and the
//! in-memory map is zeroised when the build terminates.

mod cipher;

pub use cipher::SecretCipher;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use zeroize::Zeroizing;

use crate::database::{Database, DatabaseError};
use crate::types::ProjectId;

/// Error type for vault operations
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Invalid secret name: {0:?} (expected [A-Z_][A-Z0-9_]*)")]
    InvalidName(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

pub type VaultResult<T> = Result<T, VaultError>;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new("^[A-Z_][A-Z0-9_]*$").unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

/// Validate a secret name against `[A-Z_][A-Z0-9_]*`
pub fn valid_secret_name(name: &str) -> bool {
    name_pattern().is_match(name)
}

/// Decrypted secrets for one build; zeroised on drop
#[derive(Default)]
pub struct SecretMap {
    inner: HashMap<String, Zeroizing<String>>,
}

impl SecretMap {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner.get(name).map(|v| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The secret vault
pub struct SecretVault {
    db: Arc<Database>,
    cipher: SecretCipher,
}

impl SecretVault {
    pub fn new(db: Arc<Database>, passphrase: String) -> Self {
        Self {
            db,
            cipher: SecretCipher::new(passphrase),
        }
    }

    /// Store a secret; rejects invalid names, overwrites on collision
    pub async fn put(
        &self,
        project_id: ProjectId,
        name: &str,
        plaintext: &str,
        now: DateTime<Utc>,
    ) -> VaultResult<()> {
        if !valid_secret_name(name) {
            return Err(VaultError::InvalidName(name.to_string()));
        }
        let ciphertext = self.cipher.encrypt(plaintext)?;
        self.db.put_secret(project_id, name, &ciphertext, now).await?;
        Ok(())
    }

    /// Delete a secret; returns whether it existed
    pub async fn delete(&self, project_id: ProjectId, name: &str) -> VaultResult<bool> {
        Ok(self.db.delete_secret(project_id, name).await?)
    }

    /// Decrypt every secret of a project for use inside one build.
    ///
    /// Called exactly once per build, immediately before container
    /// provisioning; the caller drops (and thereby zeroises) the map when
    /// the build terminates.
    pub async fn materialise(&self, project_id: ProjectId) -> VaultResult<SecretMap> {
        let rows = self.db.secrets_for_project(project_id).await?;

        let mut map = SecretMap::default();
        for (name, ciphertext) in rows {
            let plaintext = self.cipher.decrypt(&ciphertext)?;
            map.inner.insert(name, plaintext);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> SecretVault {
        let db = Arc::new(Database::open_in_memory().unwrap());
        SecretVault::new(db, "test-passphrase".into())
    }

    #[test]
    fn test_name_validation() {
        assert!(valid_secret_name("DB_PASSWORD"));
        assert!(valid_secret_name("_PRIVATE"));
        assert!(valid_secret_name("A1"));
        assert!(!valid_secret_name("1A"));
        assert!(!valid_secret_name("lower_case"));
        assert!(!valid_secret_name("WITH-DASH"));
        assert!(!valid_secret_name(""));
    }

    #[tokio::test]
    async fn test_put_and_materialise() {
        let vault = vault();
        let now = Utc::now();

        vault.put(1, "DB_PASSWORD", "hunter2", now).await.unwrap();
        vault.put(1, "API_KEY", "abc123", now).await.unwrap();

        let secrets = vault.materialise(1).await.unwrap();
        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets.get("DB_PASSWORD"), Some("hunter2"));
        assert_eq!(secrets.get("API_KEY"), Some("abc123"));
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let vault = vault();
        let err = vault.put(1, "bad-name", "v", Utc::now()).await;
        assert!(matches!(err, Err(VaultError::InvalidName(_))));
    }

    #[tokio::test]
    async fn test_overwrite_on_collision() {
        let vault = vault();
        let now = Utc::now();

        vault.put(1, "KEY", "old", now).await.unwrap();
        vault.put(1, "KEY", "new", now).await.unwrap();

        let secrets = vault.materialise(1).await.unwrap();
        assert_eq!(secrets.get("KEY"), Some("new"));
    }

    #[tokio::test]
    async fn test_plaintext_never_persisted() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let vault = SecretVault::new(db.clone(), "pass".into());
        vault.put(1, "TOKEN", "sensitive", Utc::now()).await.unwrap();

        let rows = db.secrets_for_project(1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].1.contains("sensitive"));
    }

    #[tokio::test]
    async fn test_delete() {
        let vault = vault();
        vault.put(1, "KEY", "v", Utc::now()).await.unwrap();
        assert!(vault.delete(1, "KEY").await.unwrap());
        assert!(!vault.delete(1, "KEY").await.unwrap());
        assert!(vault.materialise(1).await.unwrap().is_empty());
    }
}
