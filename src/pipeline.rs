//! Log pipeline.
//!
//! Every log line a build produces flows through here. Each entry is
//! assigned the next dense sequence number for its build, appended to the
//! durable store, and only then fanned out to live subscribers on the hub.
//! The store is authoritative; the live stream is allowed to lose slow
//! subscribers but persistence never drops a line.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::database::{Database, DatabaseResult};
use crate::events::{Hub, HubEvent, Subscription};
use crate::types::{BuildId, LogEntry, LogKind};

/// Synthetic entry persisted once per build when live delivery overflows
pub const CAP_WARNING: &str = "log buffering capped; older lines dropped from live stream only";

struct BuildLogState {
    /// Critical section for sequence assignment and store-before-hub order
    write_lock: Mutex<()>,
    /// Whether the live-stream cap warning has been emitted
    cap_warned: AtomicBool,
}

impl BuildLogState {
    fn new() -> Self {
        Self {
            write_lock: Mutex::new(()),
            cap_warned: AtomicBool::new(false),
        }
    }
}

/// The log pipeline
pub struct LogPipeline {
    db: Arc<Database>,
    hub: Arc<Hub>,
    clock: Arc<dyn Clock>,
    states: DashMap<BuildId, Arc<BuildLogState>>,
}

impl LogPipeline {
    pub fn new(db: Arc<Database>, hub: Arc<Hub>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            hub,
            clock,
            states: DashMap::new(),
        }
    }

    fn state(&self, build_id: BuildId) -> Arc<BuildLogState> {
        self.states
            .entry(build_id)
            .or_insert_with(|| Arc::new(BuildLogState::new()))
            .clone()
    }

    /// Append one entry: persist, then fan out live.
    ///
    /// Returns the stored entry with its assigned sequence.
    pub async fn append(
        &self,
        build_id: BuildId,
        kind: LogKind,
        step_name: Option<&str>,
        message: &str,
    ) -> DatabaseResult<LogEntry> {
        let state = self.state(build_id);
        let _guard = state.write_lock.lock().await;

        let entry = self.persist_and_publish(build_id, kind, step_name, message).await?;

        Ok(entry)
    }

    async fn persist_and_publish(
        &self,
        build_id: BuildId,
        kind: LogKind,
        step_name: Option<&str>,
        message: &str,
    ) -> DatabaseResult<LogEntry> {
        let at = self.clock.now();
        // Durability before fan-out: on hub failure the store stays
        // authoritative
        let sequence = self
            .db
            .append_log(build_id, kind, step_name, message, at)
            .await?;

        let entry = LogEntry {
            build_id,
            sequence,
            kind,
            step_name: step_name.map(String::from),
            message: message.to_string(),
            at,
        };

        let dropped = self.hub.publish(build_id, HubEvent::Log(entry.clone()));

        if dropped > 0 {
            let state = self.state(build_id);
            if !state.cap_warned.swap(true, Ordering::SeqCst) {
                let seq = self
                    .db
                    .append_log(build_id, LogKind::Warning, None, CAP_WARNING, at)
                    .await?;
                self.hub.publish(
                    build_id,
                    HubEvent::Log(LogEntry {
                        build_id,
                        sequence: seq,
                        kind: LogKind::Warning,
                        step_name: None,
                        message: CAP_WARNING.to_string(),
                        at,
                    }),
                );
            }
        }

        Ok(entry)
    }

    /// Subscribe with retrospective replay: persisted entries with
    /// `sequence > after_sequence` first, then live entries, each entry
    /// exactly once and in order.
    ///
    /// `live` controls whether the stream stays attached after replay;
    /// terminal builds replay and end.
    pub async fn subscribe(
        &self,
        build_id: BuildId,
        after_sequence: i64,
        live: bool,
    ) -> DatabaseResult<LogStream> {
        // Attach to the hub before reading the snapshot so nothing falls
        // between replay and live; duplicates are filtered by sequence.
        let subscription = live.then(|| self.hub.subscribe(build_id));
        let replay = self.db.logs_after(build_id, after_sequence).await?;

        let last_replayed = replay.last().map(|e| e.sequence).unwrap_or(after_sequence);

        Ok(LogStream {
            replay: replay.into_iter(),
            live: subscription,
            last_seq: last_replayed,
        })
    }

    /// Drop per-build pipeline state once the build is terminal
    pub fn finish_build(&self, build_id: BuildId) {
        if self.states.remove(&build_id).is_some() {
            debug!(build_id, "Released log pipeline state");
        }
    }
}

/// Ordered, exactly-once stream of one build's log entries
pub struct LogStream {
    replay: std::vec::IntoIter<LogEntry>,
    live: Option<Subscription>,
    last_seq: i64,
}

impl LogStream {
    /// Next entry; `None` when the build's topic closes (or, for
    /// replay-only streams, when replay is exhausted)
    pub async fn next(&mut self) -> Option<LogEntry> {
        if let Some(entry) = self.replay.next() {
            self.last_seq = entry.sequence;
            return Some(entry);
        }

        let live = self.live.as_mut()?;
        while let Some(event) = live.recv().await {
            if let HubEvent::Log(entry) = event {
                // Entries already replayed arrive again through the live
                // attach window; sequence order filters them out
                if entry.sequence > self.last_seq {
                    self.last_seq = entry.sequence;
                    return Some(entry);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn pipeline() -> (Arc<LogPipeline>, Arc<Database>, Arc<Hub>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let hub = Arc::new(Hub::new());
        let clock = Arc::new(SystemClock);
        (
            Arc::new(LogPipeline::new(db.clone(), hub.clone(), clock)),
            db,
            hub,
        )
    }

    #[tokio::test]
    async fn test_sequences_dense_and_monotonic() {
        let (pipeline, db, _hub) = pipeline();

        for i in 0..10 {
            let entry = pipeline
                .append(1, LogKind::Output, Some("compile"), &format!("line {i}"))
                .await
                .unwrap();
            assert_eq!(entry.sequence, i + 1);
        }

        let stored = db.logs_after(1, 0).await.unwrap();
        let seqs: Vec<i64> = stored.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_persisted_before_fanout() {
        let (pipeline, db, hub) = pipeline();
        let mut sub = hub.subscribe(1);

        pipeline.append(1, LogKind::Info, None, "hello").await.unwrap();

        // The live event must reference an already-persisted sequence
        let event = sub.recv().await.unwrap();
        let seq = event.log_sequence().unwrap();
        let stored = db.logs_after(1, seq - 1).await.unwrap();
        assert_eq!(stored[0].sequence, seq);
    }

    #[tokio::test]
    async fn test_replay_then_live_exactly_once() {
        let (pipeline, _db, _hub) = pipeline();

        for i in 0..5 {
            pipeline
                .append(1, LogKind::Output, None, &format!("early {i}"))
                .await
                .unwrap();
        }

        let mut stream = pipeline.subscribe(1, 0, true).await.unwrap();

        // Live entries appended after subscription
        for i in 0..3 {
            pipeline
                .append(1, LogKind::Output, None, &format!("late {i}"))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            let entry = stream.next().await.unwrap();
            seen.push(entry.sequence);
        }
        assert_eq!(seen, (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_replay_respects_after_sequence() {
        let (pipeline, _db, _hub) = pipeline();

        for i in 0..6 {
            pipeline
                .append(2, LogKind::Output, None, &format!("l{i}"))
                .await
                .unwrap();
        }

        let mut stream = pipeline.subscribe(2, 4, false).await.unwrap();
        assert_eq!(stream.next().await.unwrap().sequence, 5);
        assert_eq!(stream.next().await.unwrap().sequence, 6);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_overflow_persists_everything_and_warns_live() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let hub = Arc::new(Hub::with_capacity(8));
        let pipeline = LogPipeline::new(db.clone(), hub.clone(), Arc::new(SystemClock));

        // A subscriber that never drains
        let _slow = hub.subscribe(1);

        for i in 0..20 {
            pipeline
                .append(1, LogKind::Output, None, &format!("line {i}"))
                .await
                .unwrap();
        }

        // Every line persisted, plus exactly one synthetic cap warning
        let stored = db.logs_after(1, 0).await.unwrap();
        let warnings: Vec<_> = stored
            .iter()
            .filter(|e| e.kind == LogKind::Warning && e.message == CAP_WARNING)
            .collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(stored.len(), 21);
        // Still dense despite the interleaved warning
        let seqs: Vec<i64> = stored.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (1..=21).collect::<Vec<_>>());
    }
}
