//! Per-execution event emitter: monotonic indices, persistence with retry,
//! synchronous fan-out to live subscribers, and replay-then-attach reconnection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::warn;
use uuid::Uuid;

use super::record::{EventKind, EventRecord};
use super::store::EventStore;

const BROADCAST_CAPACITY: usize = 1024;

/// Emits events for a single execution. Cheap to clone: the broadcast sender
/// and shared state are behind an `Arc`.
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: Uuid,
    store: Arc<dyn EventStore>,
    sender: broadcast::Sender<EventRecord>,
    /// Guards the whole assign-index/persist/fan-out sequence so concurrent
    /// emits (e.g. from parallel-executor chunks sharing this emitter through
    /// a child `NodeEventEmitter`) can't interleave and deliver out of index
    /// order on the broadcast channel.
    next_index: Arc<Mutex<u64>>,
    closed: Arc<AtomicBool>,
}

impl EventEmitter {
    pub fn new(execution_id: Uuid, store: Arc<dyn EventStore>) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            execution_id,
            store,
            sender,
            next_index: Arc::new(Mutex::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Assign the next index, persist (retrying up to 3 times, 100ms*attempt),
    /// then fan out to subscribers. A terminal persistence failure only warns —
    /// it never blocks delivery to live subscribers.
    ///
    /// The whole sequence runs under `next_index`'s lock: two concurrent
    /// callers (e.g. sibling chunks of a parallel node) serialize here rather
    /// than racing to persist/send out of index order.
    pub async fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        if self.is_closed() {
            warn!(execution_id = %self.execution_id, ?kind, "emit() called after close(); dropping event");
            return;
        }

        let mut next_index = self.next_index.lock().await;
        let index = *next_index;
        let record = EventRecord::new(self.execution_id, index, kind, payload);

        self.persist_with_retry(record.clone()).await;

        // A lagged/disconnected subscriber simply misses live delivery; it will
        // catch up via replay() on reconnect. No receivers is not an error.
        let _ = self.sender.send(record);

        *next_index += 1;
    }

    async fn persist_with_retry(&self, record: EventRecord) {
        const MAX_ATTEMPTS: u32 = 3;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.store.append(record.clone()).await {
                Ok(()) => return,
                Err(err) => {
                    if attempt == MAX_ATTEMPTS {
                        warn!(
                            execution_id = %self.execution_id,
                            index = record.index,
                            %err,
                            "event persistence failed after {} attempts; live subscribers unaffected",
                            MAX_ATTEMPTS
                        );
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
            }
        }
    }

    /// Subscribe starting from `from_index`: first drains persisted history,
    /// then returns a live receiver for anything emitted from here on. The
    /// caller is responsible for tracking the last applied index to de-duplicate
    /// the seam, as the live receiver may itself re-deliver the tail of history.
    pub async fn subscribe_from(&self, from_index: u64) -> (Vec<EventRecord>, broadcast::Receiver<EventRecord>) {
        let receiver = self.sender.subscribe();
        let history = self.replay(from_index).await;
        (history, receiver)
    }

    pub async fn replay(&self, from_index: u64) -> Vec<EventRecord> {
        self.store.replay(self.execution_id, from_index).await.unwrap_or_else(|err| {
            warn!(execution_id = %self.execution_id, %err, "replay failed; returning empty history");
            Vec::new()
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::store::InMemoryEventStore;

    #[tokio::test]
    async fn emits_with_gap_free_monotonic_indices() {
        let store = Arc::new(InMemoryEventStore::new());
        let emitter = EventEmitter::new(Uuid::new_v4(), store);
        emitter.emit(EventKind::ExecutionStart, serde_json::json!({})).await;
        emitter.emit(EventKind::NodeStart, serde_json::json!({"nodeId": "a"})).await;
        emitter.emit(EventKind::ExecutionComplete, serde_json::json!({})).await;

        let history = emitter.replay(0).await;
        let indices: Vec<u64> = history.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(history.last().unwrap().kind.is_terminal());
    }

    #[tokio::test]
    async fn drops_emits_after_close() {
        let store = Arc::new(InMemoryEventStore::new());
        let emitter = EventEmitter::new(Uuid::new_v4(), store);
        emitter.emit(EventKind::ExecutionStart, serde_json::json!({})).await;
        emitter.close();
        emitter.emit(EventKind::ExecutionComplete, serde_json::json!({})).await;
        let history = emitter.replay(0).await;
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn replay_from_middle_returns_suffix() {
        let store = Arc::new(InMemoryEventStore::new());
        let emitter = EventEmitter::new(Uuid::new_v4(), store);
        for i in 0..5 {
            emitter.emit(EventKind::NodeStart, serde_json::json!({"i": i})).await;
        }
        let suffix = emitter.replay(3).await;
        assert_eq!(suffix.iter().map(|e| e.index).collect::<Vec<_>>(), vec![3, 4]);
    }
}
