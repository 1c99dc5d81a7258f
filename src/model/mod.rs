//! Flow/Node/Execution data model.

pub mod execution;
pub mod flow;

pub use execution::{BlockExecution, Execution, ExecutionPath, ExecutionStatus, NodeState, NodeStatus, Trigger};
pub use flow::{Edge, Flow, Node, NodeId, NodeKind, NodeKindTag, SinkType};
pub use crate::state_machine::Metrics;
