//! Worker pool.
//!
//! A bounded set of workers, each owning at most one build at a time. A
//! worker dequeues, hands the build to the executor under a cancellable
//! per-build context, acknowledges the delivery, and reports
//! infrastructure failures back to the coordinator for a single automatic
//! retry.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::executor::Executor;
use crate::queue::WorkQueue;
use crate::types::BuildId;

/// Cancel tokens of builds currently executing in this process, shared
/// between the workers (which register them) and the coordinator (which
/// signals them)
pub type RunningBuilds = Arc<DashMap<BuildId, CancellationToken>>;

/// The worker pool
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    executor: Arc<Executor>,
    coordinator: Arc<Coordinator>,
    running: RunningBuilds,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    count: usize,
    drain_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<WorkQueue>,
        executor: Arc<Executor>,
        coordinator: Arc<Coordinator>,
        running: RunningBuilds,
        count: usize,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            executor,
            coordinator,
            running,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            count,
            drain_timeout,
        }
    }

    /// Spawn the workers
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        for worker_id in 0..self.count {
            let queue = self.queue.clone();
            let executor = self.executor.clone();
            let coordinator = self.coordinator.clone();
            let running = self.running.clone();
            let shutdown = self.shutdown.clone();

            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, queue, executor, coordinator, running, shutdown).await;
            }));
        }
        info!(count = self.count, "Worker pool started");
    }

    /// Cancel the dequeue contexts and in-flight builds, then wait up to
    /// the drain deadline for workers to finish
    pub async fn shutdown(&self) {
        info!("Worker pool shutting down...");
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            warn!("Workers did not drain within {:?}", self.drain_timeout);
        } else {
            info!("Worker pool drained");
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<WorkQueue>,
    executor: Arc<Executor>,
    coordinator: Arc<Coordinator>,
    running: RunningBuilds,
    shutdown: CancellationToken,
) {
    debug!(worker_id, "Worker started");

    loop {
        let dispatch = match queue.dequeue_blocking(&shutdown).await {
            Ok(Some(dispatch)) => dispatch,
            Ok(None) => break,
            Err(e) => {
                error!(worker_id, "Dequeue failed: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let build_id = dispatch.build.id;

        // The build context: cancelled by the coordinator on user cancel,
        // or by shutdown. Registered before the executor can transition
        // the build to running so a cancel never falls between.
        let ctx = shutdown.child_token();
        running.insert(build_id, ctx.clone());

        let status = executor.run(build_id, ctx).await;

        running.remove(&build_id);

        if let Err(e) = queue.ack(&dispatch.token).await {
            warn!(worker_id, build_id, "Ack failed: {}", e);
        }

        coordinator.auto_retry_infrastructure(build_id).await;

        debug!(worker_id, build_id, %status, "Worker finished build");
    }

    debug!(worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, SystemClock};
    use crate::config::BuildConfiguration;
    use crate::database::Database;
    use crate::events::Hub;
    use crate::executor::ExecutorConfig;
    use crate::pipeline::LogPipeline;
    use crate::repo::fake::FakeMaterialiser;
    use crate::reporter::StatusReporter;
    use crate::runtime::fake::{FakeExec, FakeRuntime};
    use crate::sync::BuildLocks;
    use crate::types::{BuildStatus, Phase, Project, Trigger, TriggerKind};
    use crate::vault::SecretVault;
    use tempfile::TempDir;

    struct Harness {
        pool: Arc<WorkerPool>,
        coordinator: Arc<Coordinator>,
        db: Arc<Database>,
        runtime: Arc<FakeRuntime>,
        project_id: i64,
        _dirs: (TempDir, TempDir),
    }

    async fn harness(worker_count: usize) -> Harness {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let hub = Arc::new(Hub::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let pipeline = Arc::new(LogPipeline::new(db.clone(), hub.clone(), clock.clone()));
        let runtime = Arc::new(FakeRuntime::new());
        let materialiser = Arc::new(FakeMaterialiser::new());
        let vault = Arc::new(SecretVault::new(db.clone(), "test".into()));
        let reporter = Arc::new(StatusReporter::disabled());
        let locks = Arc::new(BuildLocks::new());
        let queue = Arc::new(WorkQueue::new(
            db.clone(),
            clock.clone(),
            Duration::from_secs(600),
        ));
        let running: RunningBuilds = Arc::new(DashMap::new());

        let artifacts = TempDir::new().unwrap();
        let caches = TempDir::new().unwrap();

        let executor = Arc::new(crate::executor::Executor::new(
            db.clone(),
            pipeline.clone(),
            runtime.clone(),
            materialiser,
            vault,
            reporter,
            hub.clone(),
            locks,
            clock.clone(),
            ExecutorConfig {
                build: BuildConfiguration {
                    default_timeout_min: 10,
                    max_timeout_min: 30,
                    default_image: "ubuntu:24.04".into(),
                },
                artifacts_root: artifacts.path().to_path_buf(),
                cache_root: caches.path().to_path_buf(),
                artifact_retention: chrono::Duration::days(14),
            },
        ));

        let coordinator = Arc::new(Coordinator::new(
            db.clone(),
            queue.clone(),
            hub,
            pipeline,
            clock,
            running.clone(),
        ));

        let project_id = db
            .insert_project(&Project {
                id: 0,
                repository: "acme/widget".into(),
                default_branch: "main".into(),
                branch_filter: None,
                build_pull_requests: false,
                max_duration_secs: 600,
                image: None,
                profile: None,
                required_secrets: vec![],
                phases: vec![Phase {
                    name: "compile".into(),
                    command: "cargo build".into(),
                }],
                allow_host_engine: false,
                notify_on_failure: false,
                owner_id: 1,
            })
            .await
            .unwrap();

        let pool = Arc::new(WorkerPool::new(
            queue,
            executor,
            coordinator.clone(),
            running,
            worker_count,
            Duration::from_secs(5),
        ));

        Harness {
            pool,
            coordinator,
            db,
            runtime,
            project_id,
            _dirs: (artifacts, caches),
        }
    }

    fn trigger() -> Trigger {
        Trigger {
            repo_full_name: "acme/widget".into(),
            commit_sha: "abc0123".into(),
            branch: "main".into(),
            pr_number: None,
            trigger_kind: TriggerKind::Push,
            author: "dev".into(),
            message: "msg".into(),
        }
    }

    async fn wait_for_terminal(db: &Database, build_id: BuildId) -> BuildStatus {
        for _ in 0..200 {
            let build = db.get_build(build_id).await.unwrap();
            if build.status.is_terminal() {
                return build.status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("build {build_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_pool_runs_build_and_acks_delivery() {
        let h = harness(2).await;
        h.runtime.script("cargo build", FakeExec::success(&["ok"]));

        let build_id = h.coordinator.enqueue(h.project_id, &trigger()).await.unwrap();
        h.pool.start();

        assert_eq!(wait_for_terminal(&h.db, build_id).await, BuildStatus::Success);

        // Token retired after the run
        let build = h.db.get_build(build_id).await.unwrap();
        assert!(build.dispatch_token.is_none());

        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_inflight_builds_bounded_by_worker_count() {
        let h = harness(1).await;
        h.runtime.script(
            "cargo build",
            FakeExec::sleeping(Duration::from_millis(100)),
        );

        let first = h.coordinator.enqueue(h.project_id, &trigger()).await.unwrap();
        let second = h.coordinator.enqueue(h.project_id, &trigger()).await.unwrap();
        h.pool.start();

        // Sample concurrency while both builds work through the queue
        loop {
            let running = h.db.running_count().await.unwrap();
            assert!(running <= 1, "in-flight builds exceeded worker count");

            let b2 = h.db.get_build(second).await.unwrap();
            if b2.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(wait_for_terminal(&h.db, first).await, BuildStatus::Success);
        assert_eq!(wait_for_terminal(&h.db, second).await, BuildStatus::Success);

        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_inflight_build() {
        let h = harness(1).await;
        h.runtime
            .script("cargo build", FakeExec::sleeping(Duration::from_secs(60)));

        let build_id = h.coordinator.enqueue(h.project_id, &trigger()).await.unwrap();
        h.pool.start();

        // Wait until the build is actually running
        for _ in 0..100 {
            if h.db.get_build(build_id).await.unwrap().status == BuildStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        h.pool.shutdown().await;

        let build = h.db.get_build(build_id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_worker_skips_build_cancelled_in_queue() {
        let h = harness(1).await;
        let build_id = h.coordinator.enqueue(h.project_id, &trigger()).await.unwrap();
        h.coordinator.cancel(build_id).await.unwrap();

        h.pool.start();
        // Give the pool a moment; the cancelled build must stay cancelled
        tokio::time::sleep(Duration::from_millis(100)).await;

        let build = h.db.get_build(build_id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Cancelled);
        assert!(h.runtime.provisioned.lock().is_empty());

        h.pool.shutdown().await;
    }
}
