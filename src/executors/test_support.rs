//! Shared test fixtures for node executor unit tests.
#![cfg(test)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::provider::{AiProvider, ChatOutcome, ChatRequest, StreamChunk};
use super::ExecutorContext;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::{EventEmitter, FlowEventAggregator, InMemoryEventStore};
use crate::fallback::FallbackTracker;
use crate::model::flow::{Edge, Flow, Node};
use crate::sandbox::{SandboxLimits, SandboxOutput, SandboxRunner};

pub struct EchoProvider;

#[async_trait]
impl AiProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, EngineError> {
        Ok(ChatOutcome {
            chunks: vec![StreamChunk::Token("ok".into())],
            output: serde_json::json!({ "echo": request.input }),
            tokens_input: 1,
            tokens_output: 1,
        })
    }
}

pub struct NoopSandbox;

#[async_trait]
impl SandboxRunner for NoopSandbox {
    async fn run(&self, _code: &str, input: Value, _limits: &SandboxLimits) -> Result<SandboxOutput, EngineError> {
        Ok(SandboxOutput { result: input, duration_ms: 0, operations_count: 0 })
    }
}

pub fn empty_flow() -> Flow {
    Flow {
        id: "test-flow".into(),
        version: 1,
        name: "test".into(),
        nodes: HashMap::new(),
        edges: Vec::<Edge>::new(),
    }
}

pub fn test_ctx(flow_input: Value) -> ExecutorContext {
    test_ctx_with_flow(flow_input, empty_flow())
}

pub fn test_ctx_with_flow(flow_input: Value, flow: Flow) -> ExecutorContext {
    let store = Arc::new(InMemoryEventStore::new());
    let emitter = EventEmitter::new(Uuid::new_v4(), store);
    let aggregator = FlowEventAggregator::new(emitter);
    let node_emitter = aggregator.node_emitter("test-node", Uuid::new_v4());

    ExecutorContext {
        execution_id: Uuid::new_v4(),
        flow: Arc::new(flow),
        flow_input,
        trigger: serde_json::json!({ "kind": "manual" }),
        node_results: Arc::new(DashMap::new()),
        cancel: CancellationToken::new(),
        emitter: node_emitter,
        breaker_registry: Arc::new(CircuitBreakerRegistry::default()),
        sandbox: Arc::new(NoopSandbox),
        ai_provider: Arc::new(EchoProvider),
        fallback_tracker: FallbackTracker::new(),
        config: EngineConfig::default(),
        block_execution_id: Uuid::new_v4(),
        run_node: Arc::new(|_node_id, input| Box::pin(async move { Ok(input) })),
    }
}
