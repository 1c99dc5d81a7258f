//! Flow-level aggregator: wraps a top-level emitter and hands out
//! per-node child emitters whose events are forwarded to the same subscribers.

use uuid::Uuid;

use super::emitter::EventEmitter;
use super::record::EventKind;

/// The top-level, execution-scoped emitter plus convenience constructors for
/// per-node child emitters. All events — flow-level and node-level alike —
/// ultimately flow through the same [`EventEmitter`] (and thus the same
/// persisted index sequence and subscriber set); the "child" is a thin view
/// that auto-attaches `node_id`/`block_execution_id` to its payloads.
#[derive(Clone)]
pub struct FlowEventAggregator {
    emitter: EventEmitter,
}

impl FlowEventAggregator {
    pub fn new(emitter: EventEmitter) -> Self {
        Self { emitter }
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// A child emitter scoped to one node's block execution.
    pub fn node_emitter(&self, node_id: impl Into<String>, block_execution_id: Uuid) -> NodeEventEmitter {
        NodeEventEmitter {
            parent: self.emitter.clone(),
            node_id: node_id.into(),
            block_execution_id,
        }
    }

    pub async fn execution_start(&self, flow_id: &str, input: &serde_json::Value) {
        self.emitter
            .emit(EventKind::ExecutionStart, serde_json::json!({ "flowId": flow_id, "input": input }))
            .await;
    }

    pub async fn execution_complete(&self, output: &serde_json::Value, metrics: &serde_json::Value) {
        self.emitter
            .emit(EventKind::ExecutionComplete, serde_json::json!({ "output": output, "metrics": metrics }))
            .await;
    }

    pub async fn execution_error(&self, error: &serde_json::Value) {
        self.emitter.emit(EventKind::ExecutionError, serde_json::json!({ "error": error })).await;
    }

    pub async fn execution_cancelled(&self) {
        self.emitter.emit(EventKind::ExecutionCancelled, serde_json::json!({})).await;
    }

    pub fn close(&self) {
        self.emitter.close();
    }
}

/// A view over the shared emitter scoped to a single node invocation.
#[derive(Clone)]
pub struct NodeEventEmitter {
    parent: EventEmitter,
    node_id: String,
    block_execution_id: Uuid,
}

impl NodeEventEmitter {
    pub async fn start(&self, node_kind: &str, input: &serde_json::Value) {
        self.parent
            .emit(
                EventKind::NodeStart,
                serde_json::json!({
                    "nodeId": self.node_id,
                    "nodeKind": node_kind,
                    "blockExecutionId": self.block_execution_id,
                    "input": input,
                }),
            )
            .await;
    }

    pub async fn stream(&self, chunk: serde_json::Value) {
        self.parent
            .emit(
                EventKind::NodeStream,
                serde_json::json!({
                    "nodeId": self.node_id,
                    "blockExecutionId": self.block_execution_id,
                    "event": chunk,
                }),
            )
            .await;
    }

    pub async fn complete(&self, output: &serde_json::Value, duration_ms: u64) {
        self.parent
            .emit(
                EventKind::NodeComplete,
                serde_json::json!({
                    "nodeId": self.node_id,
                    "blockExecutionId": self.block_execution_id,
                    "output": output,
                    "durationMs": duration_ms,
                }),
            )
            .await;
    }

    pub async fn error(&self, error: &serde_json::Value) {
        self.parent
            .emit(
                EventKind::NodeError,
                serde_json::json!({
                    "nodeId": self.node_id,
                    "blockExecutionId": self.block_execution_id,
                    "error": error,
                }),
            )
            .await;
    }

    pub async fn skipped(&self, reason: &str) {
        self.parent
            .emit(
                EventKind::NodeSkipped,
                serde_json::json!({ "nodeId": self.node_id, "reason": reason }),
            )
            .await;
    }
}
