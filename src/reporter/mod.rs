//! Status reporting.
//!
//! Surfaces build state transitions to the hosting provider's
//! commit-status endpoint and, for failed builds that ask for it, to the
//! email notifier. Reporting is best-effort: a failed post is logged at
//! warning and never alters the build's status.

mod client;

pub use client::HttpCommitStatus;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::types::{Build, BuildStatus, Project};

/// Error type for reporter operations
#[derive(Debug, thiserror::Error)]
pub enum ReporterError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Provider returned {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("Retries exhausted: {0}")]
    RetryExhausted(String),

    #[error("{0}")]
    Other(String),
}

pub type ReporterResult<T> = Result<T, ReporterError>;

/// Commit states the provider understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Pending,
    Success,
    Failure,
}

impl CommitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
        }
    }
}

/// Narrow capability for posting one commit status
#[async_trait]
pub trait CommitStatusSink: Send + Sync {
    async fn post(
        &self,
        repo_full_name: &str,
        commit_sha: &str,
        state: CommitState,
        target_url: &str,
        description: &str,
    ) -> ReporterResult<()>;
}

/// Email delivery happens outside the engine; this is its interface
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn notify_failure(&self, project: &Project, build: &Build) -> ReporterResult<()>;
}

/// The status reporter
pub struct StatusReporter {
    sink: Option<Arc<dyn CommitStatusSink>>,
    notifier: Option<Arc<dyn FailureNotifier>>,
    dashboard_url: String,
}

impl StatusReporter {
    pub fn new(
        sink: Option<Arc<dyn CommitStatusSink>>,
        notifier: Option<Arc<dyn FailureNotifier>>,
        dashboard_url: String,
    ) -> Self {
        Self {
            sink,
            notifier,
            dashboard_url: dashboard_url.trim_end_matches('/').to_string(),
        }
    }

    /// Disabled reporter; every call is a no-op
    pub fn disabled() -> Self {
        Self::new(None, None, String::new())
    }

    fn target_url(&self, build: &Build) -> String {
        if self.dashboard_url.is_empty() {
            String::new()
        } else {
            format!("{}/builds/{}", self.dashboard_url, build.id)
        }
    }

    /// Called when a build enters `Running`
    pub async fn report_running(&self, project: &Project, build: &Build) {
        self.post(
            project,
            build,
            CommitState::Pending,
            &format!("Build #{} running", build.id),
        )
        .await;
    }

    /// Called on every terminal transition
    pub async fn report_terminal(&self, project: &Project, build: &Build) {
        let (state, description) = match build.status {
            BuildStatus::Success => (CommitState::Success, format!("Build #{} passed", build.id)),
            BuildStatus::TimedOut => (
                CommitState::Failure,
                format!("Build #{} timed out", build.id),
            ),
            BuildStatus::Cancelled => (
                CommitState::Failure,
                format!("Build #{} cancelled", build.id),
            ),
            _ => (
                CommitState::Failure,
                match &build.error {
                    Some(error) => format!("Build #{} failed: {}", build.id, error),
                    None => format!("Build #{} failed", build.id),
                },
            ),
        };

        self.post(project, build, state, &description).await;

        if build.status == BuildStatus::Failed && project.notify_on_failure {
            if let Some(notifier) = &self.notifier {
                if let Err(e) = notifier.notify_failure(project, build).await {
                    warn!(build_id = build.id, "Failure notification failed: {}", e);
                }
            }
        }
    }

    async fn post(&self, project: &Project, build: &Build, state: CommitState, description: &str) {
        let Some(sink) = &self.sink else {
            return;
        };

        let target_url = self.target_url(build);
        if let Err(e) = sink
            .post(
                &project.repository,
                &build.commit,
                state,
                &target_url,
                description,
            )
            .await
        {
            warn!(
                build_id = build.id,
                state = state.as_str(),
                "Failed to post commit status: {}",
                e
            );
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! Recording sink and notifier for tests

    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct RecordingSink {
        pub posts: Mutex<Vec<(String, String, CommitState, String)>>,
    }

    #[async_trait]
    impl CommitStatusSink for RecordingSink {
        async fn post(
            &self,
            repo_full_name: &str,
            commit_sha: &str,
            state: CommitState,
            _target_url: &str,
            description: &str,
        ) -> ReporterResult<()> {
            self.posts.lock().push((
                repo_full_name.to_string(),
                commit_sha.to_string(),
                state,
                description.to_string(),
            ));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub notified: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl FailureNotifier for RecordingNotifier {
        async fn notify_failure(&self, _project: &Project, build: &Build) -> ReporterResult<()> {
            self.notified.lock().push(build.id);
            Ok(())
        }
    }
}
