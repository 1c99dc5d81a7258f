//! Execution / NodeState / BlockExecution data model.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::Metrics;

pub use crate::state_machine::ExecutionStatus;

/// One invocation of a [`crate::model::flow::Flow`] with a concrete input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub flow_id: String,
    pub flow_version: u32,
    pub input: serde_json::Value,
    pub status: ExecutionStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub triggered_by: Trigger,
    pub metrics: Metrics,
}

/// Submit-time trigger descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Manual {
        subject_id: Option<String>,
    },
    Webhook {
        request_id: Option<String>,
        ip_address: Option<String>,
        user_agent: Option<String>,
    },
    Schedule {
        scheduled_at_ms: Option<i64>,
    },
}

impl Execution {
    pub fn new_pending(flow_id: impl Into<String>, flow_version: u32, input: serde_json::Value, triggered_by: Trigger) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            flow_id: flow_id.into(),
            flow_version,
            input,
            status: ExecutionStatus::Pending,
            output: None,
            error: None,
            started_at_ms: None,
            completed_at_ms: None,
            triggered_by,
            metrics: Metrics::default(),
        }
    }
}

/// In-memory per-execution node status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    #[serde(alias = "complete")]
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub duration_ms: Option<u64>,
    pub block_execution_id: Uuid,
}

impl NodeState {
    pub fn pending(block_execution_id: Uuid) -> Self {
        Self {
            status: NodeStatus::Pending,
            input: None,
            output: None,
            error: None,
            started_at_ms: None,
            completed_at_ms: None,
            duration_ms: None,
            block_execution_id,
        }
    }
}

/// Which path a node actually executed through (hybrid routing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    Ai,
    Code,
}

/// Persisted, one-per-invocation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub status: NodeStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub duration_ms: Option<u64>,
    pub execution_path: Option<ExecutionPath>,
    pub fallback_reason: Option<String>,
    pub pattern_matched: Option<String>,
    pub match_confidence: Option<f64>,
}

impl BlockExecution {
    pub fn new_running(execution_id: Uuid, node_id: impl Into<String>, input: serde_json::Value, started_at_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            node_id: node_id.into(),
            status: NodeStatus::Running,
            input,
            output: None,
            error: None,
            started_at_ms: Some(started_at_ms),
            completed_at_ms: None,
            duration_ms: None,
            execution_path: None,
            fallback_reason: None,
            pattern_matched: None,
            match_confidence: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_complete_spelling_deserializes() {
        let v: NodeStatus = serde_json::from_str("\"complete\"").unwrap();
        assert_eq!(v, NodeStatus::Completed);
        let canonical: NodeStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(canonical, NodeStatus::Completed);
        assert_eq!(serde_json::to_string(&NodeStatus::Completed).unwrap(), "\"completed\"");
    }
}
