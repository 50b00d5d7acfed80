//! Build artifacts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::build::BuildId;

/// A file produced by a build and kept until `expires_at`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub build_id: BuildId,
    /// Path relative to the build's artifacts directory
    pub name: String,
    /// Absolute location in the artifact store
    pub storage_path: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
