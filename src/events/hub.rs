//! Topic-per-build event hub.
//!
//! Each build has its own topic; a global topic carries build lifecycle
//! events for dashboards. Every subscriber owns a bounded queue. A
//! subscriber that cannot keep up is disconnected rather than allowed to
//! back-pressure the publisher.

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{BuildId, BuildStatus, LogEntry};

/// Events delivered through the hub
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// A build entered the queue
    BuildQueued { build_id: BuildId, project_id: i64 },

    /// A build started running
    BuildStarted { build_id: BuildId },

    /// A build reached a terminal state
    BuildFinished {
        build_id: BuildId,
        status: BuildStatus,
    },

    /// A live log entry
    Log(LogEntry),
}

impl HubEvent {
    /// Sequence number when the event is a log entry
    pub fn log_sequence(&self) -> Option<i64> {
        match self {
            HubEvent::Log(entry) => Some(entry.sequence),
            _ => None,
        }
    }
}

/// Receiving half handed to a subscriber
pub struct Subscription {
    rx: mpsc::Receiver<HubEvent>,
}

impl Subscription {
    /// Next event; `None` once the topic is closed or this subscriber
    /// was dropped for falling behind
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant used by replay stitching
    pub fn try_recv(&mut self) -> Result<HubEvent, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

struct Topic {
    subscribers: Mutex<Vec<mpsc::Sender<HubEvent>>>,
}

impl Topic {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers.lock().push(tx);
        Subscription { rx }
    }

    /// Deliver to every subscriber; prune the slow and the gone.
    /// Returns the number of subscribers dropped for lagging.
    fn publish(&self, event: &HubEvent) -> usize {
        let mut dropped = 0;
        self.subscribers.lock().retain(|tx| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        dropped
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// The push-channel hub
pub struct Hub {
    topics: DashMap<BuildId, Topic>,
    global: Topic,
    /// Per-subscriber queue bound
    capacity: usize,
}

impl Hub {
    /// Default per-subscriber queue capacity (the live-stream high-water mark)
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            global: Topic::new(),
            capacity,
        }
    }

    /// Subscribe to one build's topic
    pub fn subscribe(&self, build_id: BuildId) -> Subscription {
        self.topics
            .entry(build_id)
            .or_insert_with(Topic::new)
            .subscribe(self.capacity)
    }

    /// Subscribe to the global lifecycle feed
    pub fn subscribe_global(&self) -> Subscription {
        self.global.subscribe(self.capacity)
    }

    /// Publish to a build's topic. Returns how many subscribers were
    /// disconnected for lagging.
    pub fn publish(&self, build_id: BuildId, event: HubEvent) -> usize {
        let dropped = match self.topics.get(&build_id) {
            Some(topic) => topic.publish(&event),
            None => 0,
        };
        if dropped > 0 {
            warn!(
                build_id,
                dropped, "Disconnected lagging live-log subscribers"
            );
        }
        dropped
    }

    /// Publish a lifecycle event to both the build topic and the global feed
    pub fn publish_lifecycle(&self, build_id: BuildId, event: HubEvent) {
        self.publish(build_id, event.clone());
        self.global.publish(&event);
    }

    /// Tear down a build's topic, ending all live subscriptions
    pub fn remove_topic(&self, build_id: BuildId) {
        if self.topics.remove(&build_id).is_some() {
            debug!(build_id, "Removed hub topic");
        }
    }

    /// Number of live subscribers on a build's topic
    pub fn subscriber_count(&self, build_id: BuildId) -> usize {
        self.topics
            .get(&build_id)
            .map(|t| t.subscriber_count())
            .unwrap_or(0)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
