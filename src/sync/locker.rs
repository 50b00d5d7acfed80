//! Per-build advisory locks.
//!
//! The retention sweeper and an active executor must not touch the same
//! build's rows at the same time. Each build id maps to a single-permit
//! semaphore; holding the permit is holding the advisory lock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::types::BuildId;

/// Registry of per-build advisory locks
pub struct BuildLocks {
    locks: DashMap<BuildId, Arc<Semaphore>>,
}

impl BuildLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn semaphore(&self, build_id: BuildId) -> Arc<Semaphore> {
        self.locks
            .entry(build_id)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Acquire the lock for a build, waiting if it is held
    pub async fn acquire(&self, build_id: BuildId) -> BuildLockGuard {
        let semaphore = self.semaphore(build_id);
        // acquire_owned only fails if the semaphore is closed, which never
        // happens here
        let permit = semaphore
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("build lock semaphore closed"));
        BuildLockGuard { _permit: permit }
    }

    /// Acquire without waiting; `None` when the lock is held
    pub fn try_acquire(&self, build_id: BuildId) -> Option<BuildLockGuard> {
        let semaphore = self.semaphore(build_id);
        semaphore
            .try_acquire_owned()
            .ok()
            .map(|permit| BuildLockGuard { _permit: permit })
    }

    /// Whether a build's lock is currently held
    pub fn is_locked(&self, build_id: BuildId) -> bool {
        self.locks
            .get(&build_id)
            .map(|s| s.available_permits() == 0)
            .unwrap_or(false)
    }

    /// Drop registry entries whose lock is not held.
    /// Called periodically so the map does not grow with build history.
    pub fn prune(&self) {
        self.locks
            .retain(|_, semaphore| semaphore.available_permits() == 0);
    }
}

impl Default for BuildLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that releases the advisory lock when dropped
pub struct BuildLockGuard {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = BuildLocks::new();

        let guard = locks.acquire(1).await;
        assert!(locks.is_locked(1));
        assert!(locks.try_acquire(1).is_none());

        drop(guard);
        assert!(!locks.is_locked(1));
        assert!(locks.try_acquire(1).is_some());
    }

    #[tokio::test]
    async fn test_locks_are_per_build() {
        let locks = BuildLocks::new();

        let _one = locks.acquire(1).await;
        // A different build's lock is unaffected
        assert!(locks.try_acquire(2).is_some());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = BuildLocks::new();

        let guard = locks.acquire(1).await;
        let _ = locks.acquire(2).await; // released immediately

        locks.prune();
        assert!(locks.is_locked(1));
        assert!(locks.try_acquire(2).is_some());
        drop(guard);
    }
}
