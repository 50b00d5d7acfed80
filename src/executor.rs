//! Build executor.
//!
//! Drives one build through its state machine: materialise the working
//! tree, resolve secrets, provision the container, run the declared phases
//! in order, collect artifacts, tear everything down and record the final
//! status. The first terminal classification wins; anything that goes wrong
//! during teardown is logged at warning and never alters the status.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::clock::Clock;
use crate::config::{BuildConfiguration, Configuration};
use crate::database::Database;
use crate::events::{Hub, HubEvent};
use crate::pipeline::LogPipeline;
use crate::repo::Materialiser;
use crate::reporter::StatusReporter;
use crate::runtime::{
    ContainerHandle, ContainerRuntime, ExecSpec, MountSpec, OutputLine, ProvisionSpec,
    RuntimeError, WorkspacePathMap,
};
use crate::sync::BuildLocks;
use crate::types::{
    Artifact, Build, BuildId, BuildStatus, ErrorKind, LogKind, Phase, Project,
};
use crate::vault::SecretVault;

/// Container-side locations of the dependency caches
const CACHE_MOUNTS: [(&str, &str); 2] = [
    ("pkg", "/workspace/.cache/pkg"),
    ("mod", "/workspace/.cache/mod"),
];

/// Directory inside the workspace whose contents become artifacts
const ARTIFACTS_DIR: &str = "artifacts";

/// Executor settings distilled from the daemon configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub build: BuildConfiguration,
    pub artifacts_root: PathBuf,
    /// Host root for the per-project dependency cache volumes
    pub cache_root: PathBuf,
    pub artifact_retention: chrono::Duration,
}

impl ExecutorConfig {
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            build: config.build.clone(),
            artifacts_root: config.storage.artifacts_root.clone(),
            cache_root: config.repos.root.join(".caches"),
            artifact_retention: chrono::Duration::days(config.storage.artifact_retention_days as i64),
        }
    }
}

/// First terminal classification captured during a run
#[derive(Debug)]
enum BuildFailure {
    MissingSecret(String),
    Infrastructure(String),
    Step { name: String, exit_code: i64 },
    Timeout,
    Cancelled,
}

impl BuildFailure {
    fn status(&self) -> BuildStatus {
        match self {
            BuildFailure::Timeout => BuildStatus::TimedOut,
            BuildFailure::Cancelled => BuildStatus::Cancelled,
            _ => BuildStatus::Failed,
        }
    }

    fn error_kind(&self) -> ErrorKind {
        match self {
            BuildFailure::MissingSecret(_) => ErrorKind::MissingSecret,
            BuildFailure::Infrastructure(_) => ErrorKind::Infrastructure,
            BuildFailure::Step { .. } => ErrorKind::Build,
            BuildFailure::Timeout => ErrorKind::Timeout,
            BuildFailure::Cancelled => ErrorKind::Cancelled,
        }
    }

    fn message(&self) -> String {
        match self {
            BuildFailure::MissingSecret(name) => format!("missing secret {name:?}"),
            BuildFailure::Infrastructure(msg) => msg.clone(),
            BuildFailure::Step { name, exit_code } => {
                format!("step {name:?} failed with exit code {exit_code}")
            }
            BuildFailure::Timeout => "timeout exceeded".to_string(),
            BuildFailure::Cancelled => "build cancelled".to_string(),
        }
    }
}

/// Resources created during a run that must be torn down no matter how the
/// run ends
#[derive(Default)]
struct RunScope {
    tree: Option<PathBuf>,
    handle: Option<ContainerHandle>,
}

/// The build executor
pub struct Executor {
    db: Arc<Database>,
    pipeline: Arc<LogPipeline>,
    runtime: Arc<dyn ContainerRuntime>,
    materialiser: Arc<dyn Materialiser>,
    vault: Arc<SecretVault>,
    reporter: Arc<StatusReporter>,
    hub: Arc<Hub>,
    locks: Arc<BuildLocks>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        pipeline: Arc<LogPipeline>,
        runtime: Arc<dyn ContainerRuntime>,
        materialiser: Arc<dyn Materialiser>,
        vault: Arc<SecretVault>,
        reporter: Arc<StatusReporter>,
        hub: Arc<Hub>,
        locks: Arc<BuildLocks>,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            db,
            pipeline,
            runtime,
            materialiser,
            vault,
            reporter,
            hub,
            locks,
            clock,
            config,
        }
    }

    /// Run one dispatched build to a terminal state and return it.
    ///
    /// The cancellation token is wired to the coordinator (user cancel) and
    /// to worker shutdown.
    pub async fn run(&self, build_id: BuildId, ctx: CancellationToken) -> BuildStatus {
        let _advisory = self.locks.acquire(build_id).await;

        let build = match self.db.get_build(build_id).await {
            Ok(build) => build,
            Err(e) => {
                error!(build_id, "Cannot load dispatched build: {}", e);
                return BuildStatus::Failed;
            }
        };

        // A cancel that landed while the build sat in the queue
        if build.status.is_terminal() {
            debug!(build_id, status = %build.status, "Skipping terminal build");
            return build.status;
        }

        let project = match self.db.get_project(build.project_id).await {
            Ok(project) => Some(project),
            Err(e) => {
                error!(build_id, "Cannot load project: {}", e);
                None
            }
        };

        match self.db.mark_running(build_id, self.clock.now()).await {
            Ok(true) => {}
            Ok(false) => {
                // Lost the race against a pre-dispatch cancel
                let status = self
                    .db
                    .get_build(build_id)
                    .await
                    .map(|b| b.status)
                    .unwrap_or(BuildStatus::Cancelled);
                debug!(build_id, %status, "Build no longer queued, skipping");
                return status;
            }
            Err(e) => {
                error!(build_id, "Cannot transition build to running: {}", e);
                return BuildStatus::Failed;
            }
        }

        self.hub
            .publish_lifecycle(build_id, HubEvent::BuildStarted { build_id });

        let Some(project) = project else {
            return self
                .finalize(
                    &build,
                    None,
                    Err(BuildFailure::Infrastructure("project configuration missing".into())),
                )
                .await;
        };

        self.reporter.report_running(&project, &build).await;
        info!(
            build_id,
            project = %project.repository,
            commit = %build.commit,
            "Build started"
        );

        let deadline = self.config.build.deadline_for(project.max_duration_secs);
        let deadline_at = tokio::time::Instant::now() + deadline;

        let scope = Arc::new(Mutex::new(RunScope::default()));

        let outcome = tokio::select! {
            result = self.execute(&build, &project, &scope, &ctx, deadline_at) => result,
            _ = tokio::time::sleep_until(deadline_at) => Err(BuildFailure::Timeout),
            _ = ctx.cancelled() => Err(BuildFailure::Cancelled),
        };

        self.teardown(&scope).await;
        self.finalize(&build, Some(&project), outcome).await
    }

    /// The execution recipe, from working tree to artifacts. Teardown is
    /// the caller's responsibility via the shared scope.
    async fn execute(
        &self,
        build: &Build,
        project: &Project,
        scope: &Arc<Mutex<RunScope>>,
        ctx: &CancellationToken,
        deadline_at: tokio::time::Instant,
    ) -> Result<(), BuildFailure> {
        // Working tree
        let tree = self
            .materialiser
            .materialise(project, &build.commit)
            .await
            .map_err(|e| {
                BuildFailure::Infrastructure(format!(
                    "failed to materialise commit {}: {}",
                    build.commit, e
                ))
            })?;
        scope.lock().tree = Some(tree.clone());

        // Secrets, decrypted once and checked before any container exists
        let secrets = self
            .vault
            .materialise(project.id)
            .await
            .map_err(|e| BuildFailure::Infrastructure(format!("vault error: {}", e)))?;
        for name in &project.required_secrets {
            if !secrets.contains(name) {
                return Err(BuildFailure::MissingSecret(name.clone()));
            }
        }

        // Container environment: secrets plus trigger metadata
        let mut env: HashMap<String, String> = secrets
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.insert("CI".into(), "true".into());
        env.insert("BUILD_ID".into(), build.id.to_string());
        env.insert("BUILD_COMMIT".into(), build.commit.clone());
        env.insert("BUILD_BRANCH".into(), build.branch.clone());
        env.insert(
            "BUILD_PROFILE".into(),
            project.profile.clone().unwrap_or_default(),
        );

        let mounts = self.build_mounts(project, &tree).await?;

        let image = project
            .image
            .clone()
            .unwrap_or_else(|| self.config.build.default_image.clone());

        let provision = ProvisionSpec {
            image,
            name: format!("anvil-build-{}", build.id),
            mounts,
            env,
            allow_host_engine: project.allow_host_engine,
        };

        let handle = self
            .runtime
            .provision(&provision)
            .await
            .map_err(|e| BuildFailure::Infrastructure(format!("provision failed: {}", e)))?;
        scope.lock().handle = Some(handle.clone());

        // Decrypted values are no longer needed once the container carries
        // them; drop zeroises
        drop(secrets);

        self.run_phases(build, project, &handle, &tree, ctx, deadline_at)
            .await?;

        self.collect_artifacts(build.id, &tree).await?;

        Ok(())
    }

    /// Execute the declared phases in order, bracketing each with
    /// StepStarted / StepCompleted / StepFailed entries
    async fn run_phases(
        &self,
        build: &Build,
        project: &Project,
        handle: &ContainerHandle,
        tree: &Path,
        ctx: &CancellationToken,
        deadline_at: tokio::time::Instant,
    ) -> Result<(), BuildFailure> {
        let total = project.phases.len() as i64;
        let mut completed = 0i64;
        let mut failed = 0i64;

        if let Err(e) = self.db.update_step_counts(build.id, total, 0, 0).await {
            warn!(build_id = build.id, "Cannot record step counts: {}", e);
        }

        let workspace = WorkspacePathMap::new(tree);

        for phase in &project.phases {
            self.log(build.id, LogKind::StepStarted, Some(&phase.name), &phase.command)
                .await;

            let exit_code = self
                .run_phase(build.id, handle, &workspace, tree, phase, ctx, deadline_at)
                .await;

            match exit_code {
                Ok(0) => {
                    completed += 1;
                    self.log(
                        build.id,
                        LogKind::StepCompleted,
                        Some(&phase.name),
                        "completed",
                    )
                    .await;
                    self.record_counts(build.id, total, completed, failed).await;
                }
                Ok(code) => {
                    failed += 1;
                    self.log(
                        build.id,
                        LogKind::StepFailed,
                        Some(&phase.name),
                        &format!("exit code {code}"),
                    )
                    .await;
                    self.record_counts(build.id, total, completed, failed).await;
                    return Err(BuildFailure::Step {
                        name: phase.name.clone(),
                        exit_code: code,
                    });
                }
                Err(failure) => {
                    if matches!(failure, BuildFailure::Timeout) {
                        self.log(
                            build.id,
                            LogKind::StepFailed,
                            Some(&phase.name),
                            "deadline exceeded",
                        )
                        .await;
                    }
                    self.record_counts(build.id, total, completed, failed + 1).await;
                    return Err(failure);
                }
            }
        }

        Ok(())
    }

    /// One phase: exec through the runtime, streaming output into the log
    /// pipeline. The forwarding task is joined before the step is deemed
    /// finished so no output lands after the step terminator.
    async fn run_phase(
        &self,
        build_id: BuildId,
        handle: &ContainerHandle,
        workspace: &WorkspacePathMap,
        tree: &Path,
        phase: &Phase,
        ctx: &CancellationToken,
        deadline_at: tokio::time::Instant,
    ) -> Result<i64, BuildFailure> {
        let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(BuildFailure::Timeout);
        }

        let (tx, mut rx) = mpsc::channel::<OutputLine>(256);

        let pipeline = self.pipeline.clone();
        let step = phase.name.clone();
        let forward = tokio::spawn(async move {
            while let Some(output) = rx.recv().await {
                if let Err(e) = pipeline
                    .append(build_id, LogKind::Output, Some(&step), &output.line)
                    .await
                {
                    warn!(build_id, "Cannot persist log line: {}", e);
                }
            }
        });

        let spec = ExecSpec {
            cmd: "sh".into(),
            args: vec!["-c".into(), phase.command.clone()],
            workspace: workspace.clone(),
            workdir: tree.to_path_buf(),
            env: HashMap::new(),
            stdin: crate::runtime::StdinMode::None,
            deadline: remaining,
        };

        let result = self.runtime.exec(handle, &spec, tx, ctx.clone()).await;

        // Output drained before the step result is interpreted
        let _ = forward.await;

        match result {
            Ok(code) => Ok(code),
            Err(RuntimeError::Timeout) => Err(BuildFailure::Timeout),
            Err(RuntimeError::Cancelled) => Err(BuildFailure::Cancelled),
            Err(e) => Err(BuildFailure::Infrastructure(format!(
                "exec failed: {}",
                e
            ))),
        }
    }

    /// Workspace plus the two dependency-cache volumes
    async fn build_mounts(
        &self,
        project: &Project,
        tree: &Path,
    ) -> Result<Vec<MountSpec>, BuildFailure> {
        let mut mounts = vec![MountSpec {
            source: tree.to_path_buf(),
            target: crate::runtime::WORKSPACE_ROOT.to_string(),
            read_only: false,
        }];

        for (cache, target) in CACHE_MOUNTS {
            let host = self
                .config
                .cache_root
                .join(project.id.to_string())
                .join(cache);
            tokio::fs::create_dir_all(&host)
                .await
                .map_err(|e| BuildFailure::Infrastructure(format!("cache dir: {}", e)))?;
            mounts.push(MountSpec {
                source: host,
                target: target.to_string(),
                read_only: false,
            });
        }

        Ok(mounts)
    }

    /// Copy everything under `<tree>/artifacts` into the artifact store and
    /// record a row per file
    async fn collect_artifacts(&self, build_id: BuildId, tree: &Path) -> Result<(), BuildFailure> {
        let source = tree.join(ARTIFACTS_DIR);
        if !source.is_dir() {
            return Ok(());
        }

        let dest_root = self.config.artifacts_root.join(build_id.to_string());
        let now = self.clock.now();
        let expires_at = now + self.config.artifact_retention;
        let mut count = 0usize;

        for entry in WalkDir::new(&source).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry
                .path()
                .strip_prefix(&source)
                .map_err(|e| BuildFailure::Infrastructure(e.to_string()))?
                .to_string_lossy()
                .to_string();

            let dest = dest_root.join(&name);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| BuildFailure::Infrastructure(format!("artifact store: {}", e)))?;
            }
            let size_bytes = tokio::fs::copy(entry.path(), &dest)
                .await
                .map_err(|e| BuildFailure::Infrastructure(format!("artifact copy: {}", e)))?
                as i64;

            let artifact = Artifact {
                build_id,
                name,
                storage_path: dest.to_string_lossy().to_string(),
                size_bytes,
                created_at: now,
                expires_at,
            };
            self.db
                .insert_artifact(&artifact)
                .await
                .map_err(|e| BuildFailure::Infrastructure(format!("artifact row: {}", e)))?;
            count += 1;
        }

        if count > 0 {
            info!(build_id, count, "Collected artifacts");
        }
        Ok(())
    }

    /// Stop and remove the container, release the working tree. Teardown
    /// failures are warnings only.
    async fn teardown(&self, scope: &Arc<Mutex<RunScope>>) {
        let (handle, tree) = {
            let scope = scope.lock();
            (scope.handle.clone(), scope.tree.clone())
        };

        if let Some(handle) = handle {
            if let Err(e) = self.runtime.stop(&handle).await {
                warn!(container = %handle.name, "Teardown stop failed: {}", e);
            }
            if let Err(e) = self.runtime.remove(&handle).await {
                warn!(container = %handle.name, "Teardown remove failed: {}", e);
            }
        }

        if let Some(tree) = tree {
            if let Err(e) = self.materialiser.release(&tree).await {
                warn!(tree = %tree.display(), "Teardown release failed: {}", e);
            }
        }
    }

    /// Record the terminal status, emit the closing events, and report
    async fn finalize(
        &self,
        build: &Build,
        project: Option<&Project>,
        outcome: Result<(), BuildFailure>,
    ) -> BuildStatus {
        let (status, error, error_kind) = match &outcome {
            Ok(()) => (BuildStatus::Success, None, None),
            Err(failure) => {
                let message = failure.message();
                // The entry the build page shows as the terminal error
                if matches!(failure, BuildFailure::Timeout) {
                    self.log(build.id, LogKind::Error, None, "timeout exceeded").await;
                } else if !matches!(failure, BuildFailure::Step { .. }) {
                    self.log(build.id, LogKind::Error, None, &message).await;
                }
                (failure.status(), Some(message), Some(failure.error_kind()))
            }
        };

        match self
            .db
            .finish_build(
                build.id,
                status,
                error.as_deref(),
                error_kind,
                self.clock.now(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(build_id = build.id, "Build was not running at finalisation"),
            Err(e) => error!(build_id = build.id, "Cannot record final status: {}", e),
        }

        info!(build_id = build.id, %status, "Build finished");

        self.hub.publish_lifecycle(
            build.id,
            HubEvent::BuildFinished {
                build_id: build.id,
                status,
            },
        );

        if let Some(project) = project {
            if let Ok(finished) = self.db.get_build(build.id).await {
                self.reporter.report_terminal(project, &finished).await;
            }
        }

        self.pipeline.finish_build(build.id);
        self.hub.remove_topic(build.id);

        status
    }

    async fn log(&self, build_id: BuildId, kind: LogKind, step: Option<&str>, message: &str) {
        if let Err(e) = self.pipeline.append(build_id, kind, step, message).await {
            warn!(build_id, "Cannot append log entry: {}", e);
        }
    }

    async fn record_counts(&self, build_id: BuildId, total: i64, completed: i64, failed: i64) {
        if let Err(e) = self
            .db
            .update_step_counts(build_id, total, completed, failed)
            .await
        {
            warn!(build_id, "Cannot update step counts: {}", e);
        }
    }
}
