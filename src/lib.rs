//! Flow execution engine: DAG orchestration for AI-augmented workflows.
//!
//! A [`Flow`](model::flow::Flow) is a directed acyclic graph of [`Node`](model::flow::Node)s.
//! [`FlowOrchestrator`](orchestrator::FlowOrchestrator) compiles a flow, drives it to
//! completion node by node, and streams progress through the event substrate in
//! [`event`] to any number of live or replaying subscribers.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod event;
pub mod executors;
pub mod fallback;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod retry;
pub mod routing;
pub mod sandbox;
pub mod state_machine;
pub mod storage;

pub use config::EngineConfig;
pub use error::{EngineError, ErrorKind, FlowForgeError, FlowForgeResult};
pub use model::execution::{BlockExecution, Execution, ExecutionStatus, Metrics, NodeState};
pub use model::flow::{Flow, Node, NodeKind};
pub use orchestrator::FlowOrchestrator;
