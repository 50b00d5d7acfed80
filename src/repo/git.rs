//! Working trees via the git CLI.
//!
//! Trees live at `<root>/<project-id>/<commit>/`. A commit is fetched
//! directly by sha with depth 1, so trees carry no history and arbitrary
//! commits are reachable without a full clone.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ReposConfiguration;
use crate::types::Project;

use super::{Materialiser, RepoError, RepoResult};

pub struct GitMaterialiser {
    root: PathBuf,
    clone_base: String,
    /// One mutex per repository; serialises concurrent materialisations
    repo_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl GitMaterialiser {
    pub fn new(config: &ReposConfiguration) -> Self {
        Self {
            root: config.root.clone(),
            clone_base: config.clone_base.trim_end_matches('/').to_string(),
            repo_locks: DashMap::new(),
        }
    }

    fn tree_path(&self, project: &Project, commit: &str) -> PathBuf {
        self.root.join(project.id.to_string()).join(commit)
    }

    fn clone_url(&self, repository: &str) -> String {
        format!("{}/{}.git", self.clone_base, repository)
    }

    fn repo_lock(&self, repository: &str) -> Arc<Mutex<()>> {
        self.repo_locks
            .entry(repository.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn git(args: &[&str], cwd: Option<&Path>) -> RepoResult<Output> {
        let mut command = Command::new("git");
        command.args(args);
        command.kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let output = command.output().await?;
        Ok(output)
    }

    async fn git_checked(args: &[&str], cwd: Option<&Path>) -> RepoResult<()> {
        let output = Self::git(args, cwd).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RepoError::FetchFailed(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Materialiser for GitMaterialiser {
    async fn materialise(&self, project: &Project, commit: &str) -> RepoResult<PathBuf> {
        let lock = self.repo_lock(&project.repository);
        let _guard = lock.lock().await;

        let tree = self.tree_path(project, commit);

        // A tree for this exact commit is immutable once checked out
        if tree.join(".git").exists() {
            debug!(path = %tree.display(), "Reusing existing working tree");
            return Ok(tree);
        }

        if tree.exists() {
            // Half-finished checkout from a crashed run
            warn!(path = %tree.display(), "Removing incomplete working tree");
            tokio::fs::remove_dir_all(&tree).await?;
        }
        tokio::fs::create_dir_all(&tree).await?;

        let url = self.clone_url(&project.repository);
        info!(repo = %project.repository, commit, "Materialising working tree");

        let fetch = async {
            Self::git_checked(&["init", "--quiet"], Some(&tree)).await?;
            Self::git_checked(&["remote", "add", "origin", &url], Some(&tree)).await?;
            Self::git_checked(&["fetch", "--quiet", "--depth", "1", "origin", commit], Some(&tree))
                .await?;
            Self::git_checked(&["checkout", "--quiet", "--detach", "FETCH_HEAD"], Some(&tree))
                .await
        };

        if let Err(e) = fetch.await {
            // Leave no partial tree behind
            let _ = tokio::fs::remove_dir_all(&tree).await;
            return Err(e);
        }

        Ok(tree)
    }

    async fn release(&self, path: &Path) -> RepoResult<()> {
        if !path.starts_with(&self.root) {
            return Err(RepoError::Other(format!(
                "refusing to release path outside repos root: {}",
                path.display()
            )));
        }
        if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
            debug!(path = %path.display(), "Released working tree");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Project;

    fn materialiser(root: &Path) -> GitMaterialiser {
        GitMaterialiser::new(&ReposConfiguration {
            root: root.to_path_buf(),
            clone_base: "https://github.com".into(),
        })
    }

    fn project() -> Project {
        Project {
            id: 5,
            repository: "acme/widget".into(),
            default_branch: "main".into(),
            branch_filter: None,
            build_pull_requests: false,
            max_duration_secs: 600,
            image: None,
            profile: None,
            required_secrets: vec![],
            phases: vec![],
            allow_host_engine: false,
            notify_on_failure: false,
            owner_id: 1,
        }
    }

    #[test]
    fn test_tree_path_layout() {
        let temp = tempfile::TempDir::new().unwrap();
        let m = materialiser(temp.path());
        let tree = m.tree_path(&project(), "abc123");
        assert_eq!(tree, temp.path().join("5").join("abc123"));
    }

    #[test]
    fn test_clone_url() {
        let temp = tempfile::TempDir::new().unwrap();
        let m = materialiser(temp.path());
        assert_eq!(m.clone_url("acme/widget"), "https://github.com/acme/widget.git");
    }

    #[tokio::test]
    async fn test_release_refuses_paths_outside_root() {
        let temp = tempfile::TempDir::new().unwrap();
        let m = materialiser(temp.path());
        assert!(m.release(Path::new("/etc")).await.is_err());
    }

    #[tokio::test]
    async fn test_release_removes_tree() {
        let temp = tempfile::TempDir::new().unwrap();
        let m = materialiser(temp.path());
        let tree = temp.path().join("5").join("abc");
        tokio::fs::create_dir_all(&tree).await.unwrap();

        m.release(&tree).await.unwrap();
        assert!(!tree.exists());
        // Idempotent
        m.release(&tree).await.unwrap();
    }
}
