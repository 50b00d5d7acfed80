//! Retention sweeper.
//!
//! A background task that deletes expired artifacts (file and row) and log
//! entries past the retention window. Per-build advisory locks keep it off
//! builds an executor is actively working on; anything skipped is caught on
//! a later pass.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::database::{Database, DatabaseResult};
use crate::sync::BuildLocks;

/// Outcome of one sweep pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub artifacts_removed: usize,
    pub logs_removed: usize,
}

/// The retention sweeper
pub struct RetentionSweeper {
    db: Arc<Database>,
    locks: Arc<BuildLocks>,
    clock: Arc<dyn Clock>,
    log_retention: chrono::Duration,
    sweep_interval: Duration,
}

impl RetentionSweeper {
    pub fn new(
        db: Arc<Database>,
        locks: Arc<BuildLocks>,
        clock: Arc<dyn Clock>,
        log_retention_days: u64,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            db,
            locks,
            clock,
            log_retention: chrono::Duration::days(log_retention_days as i64),
            sweep_interval,
        }
    }

    /// Sweep on a fixed interval until shutdown
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Retention sweeper stopped");
                    return;
                }
                _ = interval.tick() => {
                    match self.sweep().await {
                        Ok(stats) if stats != SweepStats::default() => {
                            info!(
                                artifacts = stats.artifacts_removed,
                                logs = stats.logs_removed,
                                "Retention sweep complete"
                            );
                        }
                        Ok(_) => debug!("Retention sweep found nothing expired"),
                        Err(e) => warn!("Retention sweep failed: {}", e),
                    }
                }
            }
        }
    }

    /// One pass: expired artifacts first, then old log entries.
    /// Idempotent for a fixed clock.
    pub async fn sweep(&self) -> DatabaseResult<SweepStats> {
        let now = self.clock.now();
        let mut stats = SweepStats::default();

        for row in self.db.expired_artifacts(now).await? {
            // An executor holding the build's lock is still writing; come
            // back next pass
            let Some(_guard) = self.locks.try_acquire(row.artifact.build_id) else {
                debug!(
                    build_id = row.artifact.build_id,
                    "Skipping artifact sweep for active build"
                );
                continue;
            };

            match tokio::fs::remove_file(&row.artifact.storage_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(
                        path = %row.artifact.storage_path,
                        "Cannot delete artifact file: {}", e
                    );
                    continue; // keep the row so a later pass retries
                }
            }

            if self.db.delete_artifact(row.id).await? {
                stats.artifacts_removed += 1;
            }
        }

        let cutoff = now - self.log_retention;
        stats.logs_removed = self.db.delete_logs_before(cutoff).await?;

        self.locks.prune();
        Ok(stats)
    }
}
