//! Persistence contract for the event log, plus an in-memory reference impl.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::record::EventRecord;

/// What the emitter depends on for durability. An implementation backs this
/// with whatever store the deployment uses; this crate ships an in-memory one.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, record: EventRecord) -> Result<(), String>;

    /// Events for `execution_id` with `index >= from_index`, ascending.
    async fn replay(&self, execution_id: Uuid, from_index: u64) -> Result<Vec<EventRecord>, String>;
}

/// Default in-memory `EventStore`, used by tests and as a development default.
#[derive(Default, Clone)]
pub struct InMemoryEventStore {
    inner: Arc<RwLock<HashMap<Uuid, Vec<EventRecord>>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, record: EventRecord) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        let rows = guard.entry(record.execution_id).or_default();
        if rows.iter().any(|r| r.index == record.index) {
            return Err(format!(
                "duplicate event index {} for execution {}",
                record.index, record.execution_id
            ));
        }
        rows.push(record);
        Ok(())
    }

    async fn replay(&self, execution_id: Uuid, from_index: u64) -> Result<Vec<EventRecord>, String> {
        let guard = self.inner.read().await;
        let mut rows: Vec<EventRecord> = guard
            .get(&execution_id)
            .map(|rows| rows.iter().filter(|r| r.index >= from_index).cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|r| r.index);
        Ok(rows)
    }
}
