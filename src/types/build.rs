//! Build records and the build state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::project::ProjectId;

/// Identifier of a build (database row id)
pub type BuildId = i64;

/// What caused a build to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    PullRequest,
    Manual,
    Retry,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Push => "push",
            TriggerKind::PullRequest => "pull_request",
            TriggerKind::Manual => "manual",
            TriggerKind::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "push" => Some(TriggerKind::Push),
            "pull_request" => Some(TriggerKind::PullRequest),
            "manual" => Some(TriggerKind::Manual),
            "retry" => Some(TriggerKind::Retry),
            _ => None,
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a build.
///
/// The only permitted transitions are:
/// Queued -> Running, Queued -> Cancelled, and Running -> one of
/// {Success, Failed, Cancelled, TimedOut}. Everything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
            BuildStatus::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(BuildStatus::Queued),
            "running" => Some(BuildStatus::Running),
            "success" => Some(BuildStatus::Success),
            "failed" => Some(BuildStatus::Failed),
            "cancelled" => Some(BuildStatus::Cancelled),
            "timed_out" => Some(BuildStatus::TimedOut),
            _ => None,
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Success
                | BuildStatus::Failed
                | BuildStatus::Cancelled
                | BuildStatus::TimedOut
        )
    }

    /// Whether a transition from `self` to `to` is part of the state machine
    pub fn can_transition(&self, to: BuildStatus) -> bool {
        match (self, to) {
            (BuildStatus::Queued, BuildStatus::Running) => true,
            (BuildStatus::Queued, BuildStatus::Cancelled) => true,
            (BuildStatus::Running, BuildStatus::Success) => true,
            (BuildStatus::Running, BuildStatus::Failed) => true,
            (BuildStatus::Running, BuildStatus::Cancelled) => true,
            (BuildStatus::Running, BuildStatus::TimedOut) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a terminal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A required secret was not configured
    MissingSecret,
    /// Container engine, image pull or filesystem trouble
    Infrastructure,
    /// A user-defined phase exited non-zero
    Build,
    /// The build deadline was exceeded
    Timeout,
    /// User-initiated cancel or shutdown drain
    Cancelled,
    /// Dispatch token expired while the build was Running
    Abandoned,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingSecret => "missing_secret",
            ErrorKind::Infrastructure => "infrastructure",
            ErrorKind::Build => "build",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "missing_secret" => Some(ErrorKind::MissingSecret),
            "infrastructure" => Some(ErrorKind::Infrastructure),
            "build" => Some(ErrorKind::Build),
            "timeout" => Some(ErrorKind::Timeout),
            "cancelled" => Some(ErrorKind::Cancelled),
            "abandoned" => Some(ErrorKind::Abandoned),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempted run of a project's pipeline at a specific commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub project_id: ProjectId,
    pub commit: String,
    pub branch: String,
    pub message: String,
    pub author: String,
    pub pr_number: Option<i64>,
    pub trigger: TriggerKind,
    pub status: BuildStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub steps_total: i64,
    pub steps_completed: i64,
    pub steps_failed: i64,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Original build if this is a retry
    pub parent_build: Option<BuildId>,
    /// Outstanding work-queue delivery handle, if dispatched
    pub dispatch_token: Option<String>,
    /// Set once an automatic retry child has been created
    pub auto_retried: bool,
}

/// Compact status view handed to callers of `Coordinator::status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSnapshot {
    pub id: BuildId,
    pub project_id: ProjectId,
    pub commit: String,
    pub branch: String,
    pub status: BuildStatus,
    pub steps_total: i64,
    pub steps_completed: i64,
    pub steps_failed: i64,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub parent_build: Option<BuildId>,
}

impl Build {
    pub fn snapshot(&self) -> BuildSnapshot {
        BuildSnapshot {
            id: self.id,
            project_id: self.project_id,
            commit: self.commit.clone(),
            branch: self.branch.clone(),
            status: self.status,
            steps_total: self.steps_total,
            steps_completed: self.steps_completed,
            steps_failed: self.steps_failed,
            error: self.error.clone(),
            error_kind: self.error_kind,
            queued_at: self.queued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: self.duration_ms,
            parent_build: self.parent_build,
        }
    }
}
