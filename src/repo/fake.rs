//! In-memory materialiser for tests

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::types::Project;

use super::{Materialiser, RepoError, RepoResult};

/// Hands out real temp directories so executor tests can observe artifact
/// collection against the filesystem
#[derive(Default)]
pub struct FakeMaterialiser {
    trees: Mutex<Vec<TempDir>>,
    /// Files written into every materialised tree, relative to its root
    staged: Mutex<Vec<(PathBuf, Vec<u8>)>>,
    pub released: Mutex<Vec<PathBuf>>,
    fail: Mutex<bool>,
}

impl FakeMaterialiser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next materialise call fail
    pub fn fail_next(&self) {
        *self.fail.lock() = true;
    }

    /// Seed a file into every tree this materialiser produces
    pub fn stage_file(&self, relative: impl Into<PathBuf>, contents: &[u8]) {
        self.staged.lock().push((relative.into(), contents.to_vec()));
    }

    /// Path of the most recently materialised tree
    pub fn last_tree(&self) -> Option<PathBuf> {
        self.trees.lock().last().map(|t| t.path().to_path_buf())
    }
}

#[async_trait]
impl Materialiser for FakeMaterialiser {
    async fn materialise(&self, _project: &Project, _commit: &str) -> RepoResult<PathBuf> {
        if std::mem::take(&mut *self.fail.lock()) {
            return Err(RepoError::FetchFailed("unknown commit".into()));
        }
        let dir = TempDir::new()?;
        let path = dir.path().to_path_buf();
        for (relative, contents) in self.staged.lock().iter() {
            let target = path.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, contents)?;
        }
        self.trees.lock().push(dir);
        Ok(path)
    }

    async fn release(&self, path: &Path) -> RepoResult<()> {
        self.released.lock().push(path.to_path_buf());
        Ok(())
    }
}
