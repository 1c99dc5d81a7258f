//! The event substrate's wire/storage shape.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One persisted, append-only event. `index` is per-execution monotonic and
/// gap-free; `(execution_id, index)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub execution_id: Uuid,
    pub index: u64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub created_at_ms: i64,
}

/// The closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExecutionStart,
    ExecutionComplete,
    ExecutionError,
    ExecutionCancelled,
    NodeStart,
    NodeStream,
    NodeComplete,
    NodeError,
    NodeSkipped,
}

impl EventKind {
    /// Whether this kind legally terminates an execution's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::ExecutionComplete | EventKind::ExecutionError | EventKind::ExecutionCancelled
        )
    }
}

impl EventRecord {
    pub fn new(execution_id: Uuid, index: u64, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            execution_id,
            index,
            kind,
            payload,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}
