//! Repository materialisation.
//!
//! Resolves `(repository, commit)` to a working tree on a bind-mountable
//! path under the configured repos root. Concurrent materialisations of the
//! same repository are serialised.

mod git;

#[cfg(test)]
pub mod fake;

pub use git::GitMaterialiser;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::types::Project;

/// Error type for materialisation
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Produces and frees working trees for builds
#[async_trait]
pub trait Materialiser: Send + Sync {
    /// Check out exactly the tree at `commit`; returns the host path
    async fn materialise(&self, project: &Project, commit: &str) -> RepoResult<PathBuf>;

    /// Free the working tree's disk space
    async fn release(&self, path: &Path) -> RepoResult<()>;
}
