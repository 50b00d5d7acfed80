//! Durable work queue.
//!
//! FIFO per insertion order with at-least-once delivery. The queue shares
//! the builds table: a queued row with no outstanding dispatch token is
//! available; dequeuing binds a token and hides the row for the visibility
//! window; unacknowledged work becomes visible again when the window
//! lapses.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::database::{Database, DatabaseError, NewBuild};
use crate::types::{Build, BuildId};

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// One delivery: the build plus the token that must be acknowledged
#[derive(Debug)]
pub struct Dispatch {
    pub build: Build,
    pub token: String,
}

/// The work queue
pub struct WorkQueue {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    visibility: Duration,
    wakeup: Notify,
}

/// Fallback poll period covering visibility-timeout expiry, which produces
/// no wakeup notification
const POLL_INTERVAL: Duration = Duration::from_secs(1);

impl WorkQueue {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>, visibility: Duration) -> Self {
        Self {
            db,
            clock,
            visibility,
            wakeup: Notify::new(),
        }
    }

    /// Insert a build row in `Queued` and wake a waiting worker
    pub async fn enqueue(&self, new: &NewBuild) -> QueueResult<BuildId> {
        let id = self.db.insert_build(new, self.clock.now()).await?;
        debug!(build_id = id, "Enqueued build");
        self.wakeup.notify_one();
        Ok(id)
    }

    /// Nudge waiting workers (used after nack and reconcile requeues)
    pub fn notify(&self) {
        self.wakeup.notify_one();
    }

    /// Block until work is available or the context is cancelled.
    /// Returns `None` on cancellation.
    pub async fn dequeue_blocking(&self, ctx: &CancellationToken) -> QueueResult<Option<Dispatch>> {
        loop {
            if ctx.is_cancelled() {
                return Ok(None);
            }

            let token = Uuid::new_v4().to_string();
            if let Some(build) = self
                .db
                .try_dequeue(&token, self.clock.now(), self.visibility)
                .await?
            {
                return Ok(Some(Dispatch { build, token }));
            }

            tokio::select! {
                _ = ctx.cancelled() => return Ok(None),
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Acknowledge a delivery, permanently retiring its token
    pub async fn ack(&self, token: &str) -> QueueResult<bool> {
        Ok(self.db.ack_dispatch(token).await?)
    }

    /// Return a delivery to the queue, redeliverable after `requeue_after`
    pub async fn nack(&self, token: &str, requeue_after: Duration) -> QueueResult<bool> {
        let visible_at = self.clock.now()
            + chrono::Duration::from_std(requeue_after).unwrap_or_else(|_| chrono::Duration::zero());
        let changed = self.db.nack_dispatch(token, visible_at).await?;
        if changed {
            self.wakeup.notify_one();
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::types::TriggerKind;

    async fn queue() -> (WorkQueue, crate::types::ProjectId) {
        let db = Database::open_in_memory().unwrap();
        let project_id = seed_project(&db).await;
        let queue = WorkQueue::new(Arc::new(db), Arc::new(SystemClock), Duration::from_secs(600));
        (queue, project_id)
    }

    async fn seed_project(db: &Database) -> crate::types::ProjectId {
        db.insert_project(&crate::types::Project {
            id: 0,
            repository: "acme/widget".into(),
            default_branch: "main".into(),
            branch_filter: None,
            build_pull_requests: false,
            max_duration_secs: 0,
            image: None,
            profile: None,
            required_secrets: vec![],
            phases: vec![],
            allow_host_engine: false,
            notify_on_failure: false,
            owner_id: 0,
        })
        .await
        .unwrap()
    }

    fn new_build(project_id: crate::types::ProjectId) -> NewBuild {
        NewBuild {
            project_id,
            commit: "abc".into(),
            branch: "main".into(),
            message: String::new(),
            author: String::new(),
            pr_number: None,
            trigger: TriggerKind::Push,
            parent_build: None,
        }
    }

    #[tokio::test]
    async fn test_dequeue_returns_enqueued_build() {
        let (queue, project_id) = queue().await;
        let ctx = CancellationToken::new();

        let id = queue.enqueue(&new_build(project_id)).await.unwrap();
        let dispatch = queue.dequeue_blocking(&ctx).await.unwrap().unwrap();
        assert_eq!(dispatch.build.id, id);

        assert!(queue.ack(&dispatch.token).await.unwrap());
    }

    #[tokio::test]
    async fn test_dequeue_blocks_until_enqueue() {
        let (queue, project_id) = queue().await;
        let queue = Arc::new(queue);
        let ctx = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { queue.dequeue_blocking(&ctx).await })
        };

        // Give the waiter time to park
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        queue.enqueue(&new_build(project_id)).await.unwrap();
        let dispatch = waiter.await.unwrap().unwrap();
        assert!(dispatch.is_some());
    }

    #[tokio::test]
    async fn test_dequeue_cancellation() {
        let (queue, _project_id) = queue().await;
        let queue = Arc::new(queue);
        let ctx = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { queue.dequeue_blocking(&ctx).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.cancel();

        let result = waiter.await.unwrap().unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_nack_makes_work_visible_again() {
        let (queue, project_id) = queue().await;
        let ctx = CancellationToken::new();

        queue.enqueue(&new_build(project_id)).await.unwrap();
        let first = queue.dequeue_blocking(&ctx).await.unwrap().unwrap();

        assert!(queue.nack(&first.token, Duration::ZERO).await.unwrap());

        let second = queue.dequeue_blocking(&ctx).await.unwrap().unwrap();
        assert_eq!(second.build.id, first.build.id);
        assert_ne!(second.token, first.token);
    }
}
