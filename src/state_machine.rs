//! Execution-level state machine: legal status transitions + metrics.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Execution status. Only the transitions in [`ExecutionStatus::can_transition_to`]
/// are legal; everything else is an [`InvalidTransitionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled)
    }

    pub fn can_transition_to(&self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, to),
            (Pending, Running) | (Pending, Cancelled) | (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }
}

#[derive(Debug, Error)]
#[error("invalid execution status transition: {from:?} -> {to:?}")]
pub struct InvalidTransitionError {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// Aggregate metrics tracked across an execution's node invocations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub total_duration_ms: Option<u64>,
    pub total_tokens_input: u64,
    pub total_tokens_output: u64,
    pub node_count: u32,
    pub completed_nodes: u32,
    pub failed_nodes: u32,
}

impl Metrics {
    pub fn set_node_count(&mut self, n: u32) {
        self.node_count = n;
    }

    pub fn inc_completed_nodes(&mut self) {
        self.completed_nodes += 1;
    }

    pub fn inc_failed_nodes(&mut self) {
        self.failed_nodes += 1;
    }

    pub fn add_tokens(&mut self, input: u64, output: u64) {
        self.total_tokens_input += input;
        self.total_tokens_output += output;
    }
}

/// Drives a single execution's status forward, refusing illegal transitions.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    status: ExecutionStatus,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            status: ExecutionStatus::Pending,
            started_at_ms: None,
            completed_at_ms: None,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Attempt a transition, stamping `started_at`/`completed_at` as appropriate.
    /// Never silently ignores an illegal transition — callers must handle the error.
    pub fn transition(&mut self, to: ExecutionStatus, now_ms: i64) -> Result<(), InvalidTransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransitionError { from: self.status, to });
        }
        if to == ExecutionStatus::Running {
            self.started_at_ms = Some(now_ms);
        }
        if to.is_terminal() {
            self.completed_at_ms = Some(now_ms);
        }
        self.status = to;
        Ok(())
    }

    pub fn total_duration_ms(&self) -> Option<u64> {
        match (self.started_at_ms, self.completed_at_ms) {
            (Some(start), Some(end)) => Some((end - start).max(0) as u64),
            _ => None,
        }
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}
