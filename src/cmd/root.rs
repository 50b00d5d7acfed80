//! Main daemon command - wires every collaborator and runs until shutdown

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use anvil_ci::clock::{Clock, SystemClock};
use anvil_ci::config::Configuration;
use anvil_ci::coordinator::Coordinator;
use anvil_ci::database::Database;
use anvil_ci::events::Hub;
use anvil_ci::executor::{Executor, ExecutorConfig};
use anvil_ci::pipeline::LogPipeline;
use anvil_ci::queue::WorkQueue;
use anvil_ci::repo::GitMaterialiser;
use anvil_ci::reporter::{HttpCommitStatus, StatusReporter};
use anvil_ci::retention::RetentionSweeper;
use anvil_ci::runtime::docker::DockerRuntime;
use anvil_ci::sync::BuildLocks;
use anvil_ci::vault::SecretVault;
use anvil_ci::worker::{RunningBuilds, WorkerPool};

/// How often the background reconcile pass runs
const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Run the daemon
pub async fn run(config_path: &str) -> Result<()> {
    // Load configuration
    info!("Loading configuration from: {}", config_path);
    let config = Configuration::load(config_path)?;
    let config = Arc::new(config);

    info!("Configuration loaded successfully");
    info!("  Workers: {}", config.worker.count);
    info!("  Repos root: {}", config.repos.root.display());
    info!("  Artifacts root: {}", config.storage.artifacts_root.display());
    info!("  Engine socket: {}", config.docker.socket_path);

    let passphrase = std::env::var(&config.vault.passphrase_env).with_context(|| {
        format!(
            "vault passphrase environment variable {} is not set",
            config.vault.passphrase_env
        )
    })?;

    // Constructor-time collaborators
    let db = Arc::new(Database::open(&config.storage.database_path)?);
    let hub = Arc::new(Hub::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pipeline = Arc::new(LogPipeline::new(db.clone(), hub.clone(), clock.clone()));
    let runtime = Arc::new(DockerRuntime::new(&config.docker)?);
    let materialiser = Arc::new(GitMaterialiser::new(&config.repos));
    let vault = Arc::new(SecretVault::new(db.clone(), passphrase));
    let locks = Arc::new(BuildLocks::new());

    let reporter = if config.provider.enabled() {
        let sink = HttpCommitStatus::new(&config.provider)
            .map_err(|e| anyhow::anyhow!("provider client: {}", e))?;
        Arc::new(StatusReporter::new(
            Some(Arc::new(sink)),
            None,
            config.provider.dashboard_url.clone(),
        ))
    } else {
        info!("Commit-status reporting disabled (no provider URL configured)");
        Arc::new(StatusReporter::disabled())
    };

    let queue = Arc::new(WorkQueue::new(
        db.clone(),
        clock.clone(),
        Duration::from_secs(config.queue.visibility_timeout_secs),
    ));

    let executor = Arc::new(Executor::new(
        db.clone(),
        pipeline.clone(),
        runtime.clone(),
        materialiser,
        vault,
        reporter,
        hub.clone(),
        locks.clone(),
        clock.clone(),
        ExecutorConfig::from_configuration(&config),
    ));

    let running: RunningBuilds = Arc::new(DashMap::new());
    let coordinator = Arc::new(Coordinator::new(
        db.clone(),
        queue.clone(),
        hub.clone(),
        pipeline.clone(),
        clock.clone(),
        running.clone(),
    ));

    // Resolve builds left Running by a previous process before any worker
    // can pick up new work
    match coordinator.reconcile().await {
        Ok(count) if count > 0 => info!(count, "Startup reconcile resolved abandoned builds"),
        Ok(_) => debug!("Startup reconcile found nothing to do"),
        Err(e) => error!("Startup reconcile failed: {}", e),
    }

    let shutdown = CancellationToken::new();

    // Periodic reconcile
    {
        let coordinator = coordinator.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
            interval.tick().await; // skip the immediate first tick

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Reconcile loop stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = coordinator.reconcile().await {
                            warn!("Reconcile failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    // Retention sweeper
    {
        let sweeper = RetentionSweeper::new(
            db.clone(),
            locks,
            clock,
            config.storage.log_retention_days,
            Duration::from_secs(config.retention.sweep_interval_secs),
        );
        let token = shutdown.clone();
        tokio::spawn(async move {
            sweeper.run(token).await;
        });
    }

    // Worker pool
    let pool = Arc::new(WorkerPool::new(
        queue,
        executor,
        coordinator,
        running,
        config.worker.count,
        Duration::from_secs(config.worker.drain_timeout_secs),
    ));
    pool.start();

    info!("Daemon running; waiting for work");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C handler")?;
    warn!("Received shutdown signal, draining workers...");

    shutdown.cancel();
    pool.shutdown().await;

    info!("Daemon stopped");
    Ok(())
}
