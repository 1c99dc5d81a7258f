//! Node executors: the uniform interface every node kind is driven through.

pub mod ai;
pub mod function;
pub mod loop_node;
pub mod parallel;
pub mod provider;
pub mod router;
pub mod sink;
pub mod source;
#[cfg(test)]
pub mod test_support;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::NodeEventEmitter;
use crate::fallback::FallbackTracker;
use crate::model::flow::{Flow, Node, NodeId, NodeKindTag};
use crate::sandbox::SandboxRunner;

pub use provider::AiProvider;

/// Everything a node executor may need beyond its own node/input: shared
/// resilience primitives, the sandbox, AI provider, and read access to sibling
/// node outputs and the flow's own definition (for router/parallel/loop, which
/// reference other nodes by id).
pub struct ExecutorContext {
    pub execution_id: Uuid,
    pub flow: Arc<Flow>,
    pub flow_input: Value,
    /// The submit-time trigger descriptor, serialized, as read by the source executor.
    pub trigger: Value,
    pub node_results: Arc<DashMap<NodeId, Value>>,
    pub cancel: CancellationToken,
    pub emitter: NodeEventEmitter,
    pub breaker_registry: Arc<CircuitBreakerRegistry>,
    pub sandbox: Arc<dyn SandboxRunner>,
    pub ai_provider: Arc<dyn AiProvider>,
    pub fallback_tracker: FallbackTracker,
    pub config: EngineConfig,
    pub block_execution_id: Uuid,
    /// Dispatches to another node's executor by id, honoring the same
    /// cancellation/resilience wiring as the top-level driver loop. Used by
    /// the router's classifier path, the parallel executor's processor/
    /// splitter/merger, and the loop executor's body. Supplied by the
    /// orchestrator, which owns the executor registry.
    pub run_node: Arc<dyn Fn(NodeId, Value) -> futures::future::BoxFuture<'static, Result<Value, EngineError>> + Send + Sync>,
}

impl ExecutorContext {
    /// A derived context for a nested node invocation (same execution, a new
    /// block execution id and its own node-scoped emitter).
    pub fn for_child(&self, block_execution_id: Uuid, emitter: NodeEventEmitter) -> ExecutorContext {
        ExecutorContext {
            execution_id: self.execution_id,
            flow: self.flow.clone(),
            flow_input: self.flow_input.clone(),
            trigger: self.trigger.clone(),
            node_results: self.node_results.clone(),
            cancel: self.cancel.clone(),
            emitter,
            breaker_registry: self.breaker_registry.clone(),
            sandbox: self.sandbox.clone(),
            ai_provider: self.ai_provider.clone(),
            fallback_tracker: self.fallback_tracker.clone(),
            config: self.config.clone(),
            block_execution_id,
            run_node: self.run_node.clone(),
        }
    }

    pub fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(EngineError::cancelled())
        } else {
            Ok(())
        }
    }
}

/// What a node invocation produced. Most kinds produce a plain value; `router`
/// produces a routing decision the orchestrator uses to gate traversal instead
/// of a value flowing downstream: the router does not execute downstream
/// nodes itself.
#[derive(Clone)]
pub enum ExecutorOutput {
    Value(Value),
    Route { route_key: String, target_node_id: NodeId, input: Value },
}

impl ExecutorOutput {
    pub fn into_value(self) -> Value {
        match self {
            ExecutorOutput::Value(v) => v,
            ExecutorOutput::Route { route_key, target_node_id, input } => {
                serde_json::json!({ "routeKey": route_key, "targetNodeId": target_node_id, "input": input })
            }
        }
    }
}

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, node: &Node, input: Value, ctx: &ExecutorContext) -> Result<ExecutorOutput, EngineError>;
}

/// Process-wide registry of executors keyed by node kind, populated at startup
/// The registry is process-wide and populated at startup.
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<NodeKindTag, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        let mut executors: HashMap<NodeKindTag, Arc<dyn NodeExecutor>> = HashMap::new();
        executors.insert(NodeKindTag::Source, Arc::new(source::SourceExecutor));
        executors.insert(NodeKindTag::Sink, Arc::new(sink::SinkExecutor::new()));
        executors.insert(NodeKindTag::Ai, Arc::new(ai::AiExecutor));
        executors.insert(NodeKindTag::Function, Arc::new(function::FunctionExecutor));
        executors.insert(NodeKindTag::Router, Arc::new(router::RouterExecutor));
        executors.insert(NodeKindTag::Parallel, Arc::new(parallel::ParallelExecutor));
        executors.insert(NodeKindTag::Loop, Arc::new(loop_node::LoopExecutor));
        Self { executors }
    }

    pub fn get(&self, kind: NodeKindTag) -> Result<Arc<dyn NodeExecutor>, EngineError> {
        self.executors.get(&kind).cloned().ok_or_else(|| EngineError::executor_not_found(kind))
    }

    pub fn register(&mut self, kind: NodeKindTag, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(kind, executor);
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
