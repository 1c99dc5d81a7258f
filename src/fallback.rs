//! Fallback tracker: records which path ran for a block execution and why.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::ExecutionPath;
use crate::routing::RoutingDecision;

/// One recorded routing/fallback outcome for a single block execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub block_execution_id: Uuid,
    pub node_id: String,
    pub decision: RoutingDecisionSnapshot,
    pub path_taken: ExecutionPath,
    pub fallback_reason: Option<String>,
}

/// A serializable snapshot of a [`RoutingDecision`] (avoids depending on
/// `routing::Path` directly so this module stays independently testable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecisionSnapshot {
    pub reason: String,
    pub confidence: Option<f64>,
    pub matched_pattern: Option<String>,
}

impl From<&RoutingDecision> for RoutingDecisionSnapshot {
    fn from(d: &RoutingDecision) -> Self {
        Self {
            reason: d.reason.clone(),
            confidence: d.confidence,
            matched_pattern: d.matched_pattern.clone(),
        }
    }
}

/// Per-execution tracker of fallback events: code path attempted then fell
/// back to AI, recorded against the originating block execution.
#[derive(Clone, Default)]
pub struct FallbackTracker {
    records: Arc<DashMap<Uuid, FallbackRecord>>,
}

impl FallbackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decision(&self, block_execution_id: Uuid, node_id: impl Into<String>, decision: &RoutingDecision, path_taken: ExecutionPath) {
        self.records.insert(
            block_execution_id,
            FallbackRecord {
                block_execution_id,
                node_id: node_id.into(),
                decision: decision.into(),
                path_taken,
                fallback_reason: None,
            },
        );
    }

    /// Record that the code path was attempted but failed and the node fell
    /// back to the AI path.
    pub fn record_fallback(&self, block_execution_id: Uuid, reason: impl Into<String>) {
        if let Some(mut entry) = self.records.get_mut(&block_execution_id) {
            entry.fallback_reason = Some(reason.into());
            entry.path_taken = ExecutionPath::Ai;
        }
    }

    pub fn get(&self, block_execution_id: Uuid) -> Option<FallbackRecord> {
        self.records.get(&block_execution_id).map(|e| e.clone())
    }
}
