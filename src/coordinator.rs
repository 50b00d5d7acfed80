//! Build coordinator.
//!
//! The public face of the engine: validated triggers come in, builds are
//! created and queued, cancels and retries are arbitrated, status and live
//! logs are served, and abandoned builds are reconciled. Cross-build
//! invariants (retry only from terminal non-success, idempotent cancel,
//! idempotent reconcile) are enforced here.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::database::{Database, DatabaseError, NewBuild};
use crate::events::{Hub, HubEvent};
use crate::pipeline::{LogPipeline, LogStream};
use crate::queue::{QueueError, WorkQueue};
use crate::types::{
    Build, BuildId, BuildSnapshot, BuildStatus, ErrorKind, ProjectId, Trigger, TriggerKind,
};
use crate::worker::RunningBuilds;

/// Error type for coordinator operations
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl From<DatabaseError> for CoordinatorError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => CoordinatorError::NotFound(what),
            other => CoordinatorError::Database(other),
        }
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The cancel took effect (or was already in flight)
    Cancelled,
    /// The build was already terminal; nothing to do
    NoopTerminal,
}

/// The build coordinator
pub struct Coordinator {
    db: Arc<Database>,
    queue: Arc<WorkQueue>,
    hub: Arc<Hub>,
    pipeline: Arc<LogPipeline>,
    clock: Arc<dyn Clock>,
    running: RunningBuilds,
}

impl Coordinator {
    pub fn new(
        db: Arc<Database>,
        queue: Arc<WorkQueue>,
        hub: Arc<Hub>,
        pipeline: Arc<LogPipeline>,
        clock: Arc<dyn Clock>,
        running: RunningBuilds,
    ) -> Self {
        Self {
            db,
            queue,
            hub,
            pipeline,
            clock,
            running,
        }
    }

    /// Create a build from a validated trigger and enqueue it
    pub async fn enqueue(
        &self,
        project_id: ProjectId,
        trigger: &Trigger,
    ) -> CoordinatorResult<BuildId> {
        let project = self
            .db
            .get_project(project_id)
            .await
            .map_err(|_| CoordinatorError::Validation(format!("unknown project {project_id}")))?;

        if trigger.commit_sha.len() < 7 || !trigger.commit_sha.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(CoordinatorError::Validation(format!(
                "malformed commit sha {:?}",
                trigger.commit_sha
            )));
        }

        match trigger.trigger_kind {
            TriggerKind::Push => {
                if !project.branch_matches(&trigger.branch) {
                    return Err(CoordinatorError::Validation(format!(
                        "branch {:?} does not match the project filter",
                        trigger.branch
                    )));
                }
            }
            TriggerKind::PullRequest => {
                if !project.build_pull_requests {
                    return Err(CoordinatorError::Validation(
                        "project does not build pull requests".into(),
                    ));
                }
                if trigger.pr_number.is_none() {
                    return Err(CoordinatorError::Validation(
                        "pull-request trigger without a PR number".into(),
                    ));
                }
            }
            TriggerKind::Manual => {}
            TriggerKind::Retry => {
                return Err(CoordinatorError::Validation(
                    "retry builds are created through retry()".into(),
                ));
            }
        }

        let new = NewBuild {
            project_id,
            commit: trigger.commit_sha.clone(),
            branch: trigger.branch.clone(),
            message: trigger.message.clone(),
            author: trigger.author.clone(),
            pr_number: trigger.pr_number,
            trigger: trigger.trigger_kind,
            parent_build: None,
        };

        let build_id = self.queue.enqueue(&new).await?;
        self.hub.publish_lifecycle(
            build_id,
            HubEvent::BuildQueued {
                build_id,
                project_id,
            },
        );
        info!(
            build_id,
            project = %project.repository,
            commit = %trigger.commit_sha,
            trigger = %trigger.trigger_kind,
            "Build enqueued"
        );
        Ok(build_id)
    }

    /// Cancel a build. Idempotent: repeated cancels and cancels that race
    /// completion are no-ops.
    pub async fn cancel(&self, build_id: BuildId) -> CoordinatorResult<CancelOutcome> {
        let build = self.db.get_build(build_id).await?;

        if build.status.is_terminal() {
            return Ok(CancelOutcome::NoopTerminal);
        }

        // Pre-dispatch: mark the row cancelled; the worker will observe it
        // and skip
        if build.status == BuildStatus::Queued
            && self.db.cancel_queued(build_id, self.clock.now()).await?
        {
            info!(build_id, "Cancelled queued build");
            self.hub.publish_lifecycle(
                build_id,
                HubEvent::BuildFinished {
                    build_id,
                    status: BuildStatus::Cancelled,
                },
            );
            self.pipeline.finish_build(build_id);
            self.hub.remove_topic(build_id);
            return Ok(CancelOutcome::Cancelled);
        }

        // Running (or the dispatch race was lost): signal the executor's
        // context; the executor performs the transition
        if let Some(token) = self.running.get(&build_id) {
            token.cancel();
            info!(build_id, "Cancel signalled to running build");
            return Ok(CancelOutcome::Cancelled);
        }

        // Re-read: the build may have gone terminal underneath us
        let build = self.db.get_build(build_id).await?;
        if build.status.is_terminal() {
            return Ok(CancelOutcome::NoopTerminal);
        }

        // Running somewhere this process cannot reach (e.g. abandoned);
        // reconcile will resolve it
        warn!(build_id, "Cancel requested for unreachable running build");
        Ok(CancelOutcome::Cancelled)
    }

    /// Create a new build that retries a terminal, non-successful one
    pub async fn retry(&self, build_id: BuildId) -> CoordinatorResult<BuildId> {
        let source = self.db.get_build(build_id).await?;

        if !source.status.is_terminal() {
            return Err(CoordinatorError::Validation(format!(
                "build {build_id} is not terminal"
            )));
        }
        if source.status == BuildStatus::Success {
            return Err(CoordinatorError::Validation(format!(
                "build {build_id} succeeded; nothing to retry"
            )));
        }

        let child = self.spawn_retry(&source).await?;
        info!(build_id, child, "Build retried");
        Ok(child)
    }

    /// Compact status view of one build
    pub async fn status(&self, build_id: BuildId) -> CoordinatorResult<BuildSnapshot> {
        Ok(self.db.get_build(build_id).await?.snapshot())
    }

    /// Replay persisted log entries after `after_sequence`, then attach
    /// live (terminal builds replay and end)
    pub async fn subscribe_logs(
        &self,
        build_id: BuildId,
        after_sequence: i64,
    ) -> CoordinatorResult<LogStream> {
        let build = self.db.get_build(build_id).await?;
        let live = !build.status.is_terminal();
        Ok(self.pipeline.subscribe(build_id, after_sequence, live).await?)
    }

    /// Resolve builds whose executor is no longer reachable: any `Running`
    /// build whose dispatch token's visibility window has lapsed becomes
    /// Failed/Abandoned, with a single automatic retry.
    ///
    /// Idempotent and safe to run concurrently with normal dispatch.
    pub async fn reconcile(&self) -> CoordinatorResult<usize> {
        let now = self.clock.now();
        let expired = self.db.running_with_expired_token(now).await?;
        let mut reconciled = 0;

        for build in expired {
            // A build actively executing in this process is not abandoned,
            // whatever its token says
            if self.running.contains_key(&build.id) {
                continue;
            }

            let finished = self
                .db
                .finish_build(
                    build.id,
                    BuildStatus::Failed,
                    Some("executor no longer reachable; build abandoned"),
                    Some(ErrorKind::Abandoned),
                    now,
                )
                .await?;

            if !finished {
                // Another reconcile pass won the transition
                continue;
            }

            reconciled += 1;
            warn!(build_id = build.id, "Reconciled abandoned build");

            if let Some(token) = &build.dispatch_token {
                let _ = self.db.ack_dispatch(token).await;
            }

            self.hub.publish_lifecycle(
                build.id,
                HubEvent::BuildFinished {
                    build_id: build.id,
                    status: BuildStatus::Failed,
                },
            );
            self.pipeline.finish_build(build.id);
            self.hub.remove_topic(build.id);

            // One automatic retry, and never for a build that is itself a
            // retry
            if build.trigger != TriggerKind::Retry && self.db.claim_auto_retry(build.id).await? {
                match self.spawn_retry(&build).await {
                    Ok(child) => info!(build_id = build.id, child, "Auto-retried abandoned build"),
                    Err(e) => warn!(build_id = build.id, "Auto-retry failed: {}", e),
                }
            }
        }

        if reconciled > 0 {
            info!(reconciled, "Reconcile pass complete");
        } else {
            debug!("Reconcile pass found nothing to do");
        }
        Ok(reconciled)
    }

    /// One automatic retry for infrastructure failures, invoked by workers
    /// after a build lands. No-op for every other outcome.
    pub async fn auto_retry_infrastructure(&self, build_id: BuildId) {
        let build = match self.db.get_build(build_id).await {
            Ok(build) => build,
            Err(_) => return,
        };

        let eligible = build.status == BuildStatus::Failed
            && build.error_kind == Some(ErrorKind::Infrastructure)
            && build.trigger != TriggerKind::Retry;
        if !eligible {
            return;
        }

        match self.db.claim_auto_retry(build_id).await {
            Ok(true) => match self.spawn_retry(&build).await {
                Ok(child) => {
                    info!(build_id, child, "Auto-retried after infrastructure failure")
                }
                Err(e) => warn!(build_id, "Auto-retry failed: {}", e),
            },
            Ok(false) => {}
            Err(e) => warn!(build_id, "Cannot claim auto-retry: {}", e),
        }
    }

    async fn spawn_retry(&self, source: &Build) -> CoordinatorResult<BuildId> {
        let new = NewBuild {
            project_id: source.project_id,
            commit: source.commit.clone(),
            branch: source.branch.clone(),
            message: source.message.clone(),
            author: source.author.clone(),
            pr_number: source.pr_number,
            trigger: TriggerKind::Retry,
            parent_build: Some(source.id),
        };
        let child = self.queue.enqueue(&new).await?;
        self.hub.publish_lifecycle(
            child,
            HubEvent::BuildQueued {
                build_id: child,
                project_id: source.project_id,
            },
        );
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::types::{LogKind, Phase, Project};
    use chrono::Utc;
    use dashmap::DashMap;
    use std::time::Duration;

    struct Harness {
        coordinator: Coordinator,
        db: Arc<Database>,
        queue: Arc<WorkQueue>,
        hub: Arc<Hub>,
        pipeline: Arc<LogPipeline>,
        running: RunningBuilds,
        project_id: ProjectId,
    }

    async fn harness() -> Harness {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let hub = Arc::new(Hub::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let pipeline = Arc::new(LogPipeline::new(db.clone(), hub.clone(), clock.clone()));
        let queue = Arc::new(WorkQueue::new(
            db.clone(),
            clock.clone(),
            Duration::from_secs(600),
        ));
        let running: RunningBuilds = Arc::new(DashMap::new());

        let project_id = db
            .insert_project(&Project {
                id: 0,
                repository: "acme/widget".into(),
                default_branch: "main".into(),
                branch_filter: Some("main".into()),
                build_pull_requests: false,
                max_duration_secs: 600,
                image: None,
                profile: None,
                required_secrets: vec![],
                phases: vec![Phase {
                    name: "compile".into(),
                    command: "true".into(),
                }],
                allow_host_engine: false,
                notify_on_failure: false,
                owner_id: 1,
            })
            .await
            .unwrap();

        let coordinator = Coordinator::new(
            db.clone(),
            queue.clone(),
            hub.clone(),
            pipeline.clone(),
            clock,
            running.clone(),
        );

        Harness {
            coordinator,
            db,
            queue,
            hub,
            pipeline,
            running,
            project_id,
        }
    }

    fn push_trigger(commit: &str, branch: &str) -> Trigger {
        Trigger {
            repo_full_name: "acme/widget".into(),
            commit_sha: commit.into(),
            branch: branch.into(),
            pr_number: None,
            trigger_kind: TriggerKind::Push,
            author: "dev".into(),
            message: "msg".into(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_creates_queued_build_and_event() {
        let h = harness().await;
        let mut global = h.hub.subscribe_global();

        let build_id = h
            .coordinator
            .enqueue(h.project_id, &push_trigger("abc0123", "main"))
            .await
            .unwrap();

        let build = h.db.get_build(build_id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Queued);
        assert_eq!(build.trigger, TriggerKind::Push);

        match global.recv().await {
            Some(HubEvent::BuildQueued { build_id: id, .. }) => assert_eq!(id, build_id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let h = harness().await;

        // Unknown project
        assert!(matches!(
            h.coordinator.enqueue(999, &push_trigger("abc0123", "main")).await,
            Err(CoordinatorError::Validation(_))
        ));

        // Malformed sha
        assert!(matches!(
            h.coordinator.enqueue(h.project_id, &push_trigger("xyz", "main")).await,
            Err(CoordinatorError::Validation(_))
        ));

        // Branch filter mismatch
        assert!(matches!(
            h.coordinator
                .enqueue(h.project_id, &push_trigger("abc0123", "feature/x"))
                .await,
            Err(CoordinatorError::Validation(_))
        ));

        // PR trigger against a project that does not build PRs
        let mut pr = push_trigger("abc0123", "main");
        pr.trigger_kind = TriggerKind::PullRequest;
        pr.pr_number = Some(7);
        assert!(matches!(
            h.coordinator.enqueue(h.project_id, &pr).await,
            Err(CoordinatorError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_queued_build() {
        let h = harness().await;
        let build_id = h
            .coordinator
            .enqueue(h.project_id, &push_trigger("abc0123", "main"))
            .await
            .unwrap();

        assert_eq!(
            h.coordinator.cancel(build_id).await.unwrap(),
            CancelOutcome::Cancelled
        );
        let build = h.db.get_build(build_id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Cancelled);

        // Cancel is idempotent
        assert_eq!(
            h.coordinator.cancel(build_id).await.unwrap(),
            CancelOutcome::NoopTerminal
        );
    }

    #[tokio::test]
    async fn test_cancel_running_build_signals_context() {
        let h = harness().await;
        let build_id = h
            .coordinator
            .enqueue(h.project_id, &push_trigger("abc0123", "main"))
            .await
            .unwrap();

        // Simulate dispatch: worker registers its context, executor marks
        // running
        let ctx = CancellationToken::new();
        h.running.insert(build_id, ctx.clone());
        h.db.mark_running(build_id, Utc::now()).await.unwrap();

        assert_eq!(
            h.coordinator.cancel(build_id).await.unwrap(),
            CancelOutcome::Cancelled
        );
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_retry_requires_terminal_non_success() {
        let h = harness().await;
        let build_id = h
            .coordinator
            .enqueue(h.project_id, &push_trigger("abc0123", "main"))
            .await
            .unwrap();

        // Still queued
        assert!(matches!(
            h.coordinator.retry(build_id).await,
            Err(CoordinatorError::Validation(_))
        ));

        // Successful builds cannot be retried
        h.db.mark_running(build_id, Utc::now()).await.unwrap();
        h.db.finish_build(build_id, BuildStatus::Success, None, None, Utc::now())
            .await
            .unwrap();
        assert!(matches!(
            h.coordinator.retry(build_id).await,
            Err(CoordinatorError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_creates_child_preserving_metadata() {
        let h = harness().await;
        let build_id = h
            .coordinator
            .enqueue(h.project_id, &push_trigger("abc0123", "main"))
            .await
            .unwrap();

        h.db.mark_running(build_id, Utc::now()).await.unwrap();
        h.db.finish_build(
            build_id,
            BuildStatus::Failed,
            Some("boom"),
            Some(ErrorKind::Build),
            Utc::now(),
        )
        .await
        .unwrap();

        let child_id = h.coordinator.retry(build_id).await.unwrap();
        let child = h.db.get_build(child_id).await.unwrap();

        assert_eq!(child.parent_build, Some(build_id));
        assert_eq!(child.trigger, TriggerKind::Retry);
        assert_eq!(child.commit, "abc0123");
        assert_eq!(child.status, BuildStatus::Queued);

        // The source build is untouched
        let source = h.db.get_build(build_id).await.unwrap();
        assert_eq!(source.status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn test_reconcile_abandons_expired_running_build() {
        let h = harness().await;
        let build_id = h
            .coordinator
            .enqueue(h.project_id, &push_trigger("abc0123", "main"))
            .await
            .unwrap();

        // Dispatch with a tiny visibility window, then pretend the worker
        // died
        let short_queue = WorkQueue::new(
            h.db.clone(),
            Arc::new(SystemClock),
            Duration::from_millis(10),
        );
        let ctx = CancellationToken::new();
        let dispatch = short_queue.dequeue_blocking(&ctx).await.unwrap().unwrap();
        h.db.mark_running(build_id, Utc::now()).await.unwrap();
        drop(dispatch);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let reconciled = h.coordinator.reconcile().await.unwrap();
        assert_eq!(reconciled, 1);

        let build = h.db.get_build(build_id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(build.error_kind, Some(ErrorKind::Abandoned));

        // A single auto-retry child exists
        let recent = h.db.recent_builds(10).await.unwrap();
        let children: Vec<&Build> = recent
            .iter()
            .filter(|b| b.parent_build == Some(build_id))
            .collect();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].trigger, TriggerKind::Retry);

        // Reconcile is idempotent: a second pass changes nothing
        assert_eq!(h.coordinator.reconcile().await.unwrap(), 0);
        let recent = h.db.recent_builds(10).await.unwrap();
        assert_eq!(
            recent
                .iter()
                .filter(|b| b.parent_build == Some(build_id))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_reconcile_spares_locally_running_builds() {
        let h = harness().await;
        let build_id = h
            .coordinator
            .enqueue(h.project_id, &push_trigger("abc0123", "main"))
            .await
            .unwrap();

        let short_queue = WorkQueue::new(
            h.db.clone(),
            Arc::new(SystemClock),
            Duration::from_millis(10),
        );
        let ctx = CancellationToken::new();
        short_queue.dequeue_blocking(&ctx).await.unwrap().unwrap();
        h.db.mark_running(build_id, Utc::now()).await.unwrap();
        h.running.insert(build_id, CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(h.coordinator.reconcile().await.unwrap(), 0);
        let build = h.db.get_build(build_id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Running);
    }

    #[tokio::test]
    async fn test_subscribe_logs_replays_for_terminal_build() {
        let h = harness().await;
        let build_id = h
            .coordinator
            .enqueue(h.project_id, &push_trigger("abc0123", "main"))
            .await
            .unwrap();

        h.pipeline
            .append(build_id, LogKind::Info, None, "hello")
            .await
            .unwrap();
        h.db.mark_running(build_id, Utc::now()).await.unwrap();
        h.db.finish_build(build_id, BuildStatus::Success, None, None, Utc::now())
            .await
            .unwrap();

        let mut stream = h.coordinator.subscribe_logs(build_id, 0).await.unwrap();
        let entry = stream.next().await.unwrap();
        assert_eq!(entry.message, "hello");
        // Terminal build: the stream ends after replay
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_infrastructure_auto_retry_once() {
        let h = harness().await;
        let build_id = h
            .coordinator
            .enqueue(h.project_id, &push_trigger("abc0123", "main"))
            .await
            .unwrap();

        h.db.mark_running(build_id, Utc::now()).await.unwrap();
        h.db.finish_build(
            build_id,
            BuildStatus::Failed,
            Some("engine down"),
            Some(ErrorKind::Infrastructure),
            Utc::now(),
        )
        .await
        .unwrap();

        h.coordinator.auto_retry_infrastructure(build_id).await;
        // Second call does not produce another child
        h.coordinator.auto_retry_infrastructure(build_id).await;

        let recent = h.db.recent_builds(10).await.unwrap();
        assert_eq!(
            recent
                .iter()
                .filter(|b| b.parent_build == Some(build_id))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_build_error_is_not_auto_retried() {
        let h = harness().await;
        let build_id = h
            .coordinator
            .enqueue(h.project_id, &push_trigger("abc0123", "main"))
            .await
            .unwrap();

        h.db.mark_running(build_id, Utc::now()).await.unwrap();
        h.db.finish_build(
            build_id,
            BuildStatus::Failed,
            Some("tests failed"),
            Some(ErrorKind::Build),
            Utc::now(),
        )
        .await
        .unwrap();

        h.coordinator.auto_retry_infrastructure(build_id).await;

        let recent = h.db.recent_builds(10).await.unwrap();
        assert!(recent.iter().all(|b| b.parent_build.is_none()));
    }
}
