//! End-to-end scenarios driven through the public `FlowOrchestrator` API only,
//! not already covered by `orchestrator`'s own inline unit tests: a linear
//! streaming flow, provider retry, circuit-breaker trip + half-open probe,
//! mid-flow cancellation of a sandboxed node, cancellation of an in-flight AI
//! call, and replay after a dropped subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use flowforge::circuit_breaker::CircuitBreakerConfig;
use flowforge::event::EventKind;
use flowforge::executors::provider::{ChatOutcome, ChatRequest, StreamChunk};
use flowforge::executors::AiProvider;
use flowforge::model::flow::{Edge, Flow, Node, NodeKind, SinkType};
use flowforge::model::Trigger;
use flowforge::retry::RetryPolicy;
use flowforge::sandbox::{SandboxLimits, SandboxOutput, SandboxRunner};
use flowforge::storage::{BlockExecutionStore, ExecutionStore, InMemoryFlowStore, InMemoryStore};
use flowforge::{EngineConfig, EngineError, ErrorKind, Execution, ExecutionStatus, FlowOrchestrator};

fn node(id: &str, kind: NodeKind) -> Node {
    Node { node_id: id.to_string(), kind, data: serde_json::json!({}) }
}

fn function_node(id: &str) -> Node {
    Node { node_id: id.to_string(), kind: NodeKind::Function, data: serde_json::json!({ "code": "input" }) }
}

fn edge(src: &str, dst: &str) -> Edge {
    Edge { source_node_id: src.to_string(), source_handle: None, target_node_id: dst.to_string(), target_handle: None }
}

/// An `AiProvider` no scenario in this file actually exercises, but the
/// orchestrator still requires one wired up even for flows with no `ai` node.
struct UnusedProvider;

#[async_trait]
impl AiProvider for UnusedProvider {
    fn name(&self) -> &str {
        "unused"
    }

    async fn chat(&self, _request: ChatRequest) -> Result<ChatOutcome, EngineError> {
        Err(EngineError::execution_failed("this scenario never calls the ai provider"))
    }
}

struct NoopSandbox;

#[async_trait]
impl SandboxRunner for NoopSandbox {
    async fn run(&self, _code: &str, input: Value, _limits: &SandboxLimits) -> Result<SandboxOutput, EngineError> {
        Ok(SandboxOutput { result: input, duration_ms: 0, operations_count: 0 })
    }
}

/// A sandbox that sleeps before returning, used to hold a node "in flight"
/// long enough for a test to call `cancel()` while it runs.
struct SlowSandbox {
    delay: Duration,
}

#[async_trait]
impl SandboxRunner for SlowSandbox {
    async fn run(&self, _code: &str, input: Value, _limits: &SandboxLimits) -> Result<SandboxOutput, EngineError> {
        tokio::time::sleep(self.delay).await;
        Ok(SandboxOutput { result: input, duration_ms: self.delay.as_millis() as u64, operations_count: 0 })
    }
}

/// Fails with `ProviderRateLimit` for its first `fail_times` calls, then succeeds.
struct FlakyProvider {
    calls: Arc<AtomicU32>,
    fail_times: u32,
}

#[async_trait]
impl AiProvider for FlakyProvider {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_times {
            return Err(EngineError::new(ErrorKind::ProviderRateLimit, "slow down"));
        }
        Ok(ChatOutcome {
            chunks: vec![StreamChunk::Token("ok".into())],
            output: serde_json::json!({ "echo": request.input }),
            tokens_input: 1,
            tokens_output: 1,
        })
    }
}

/// Returns a fixed sentiment verdict streamed as two tokens, reading the text
/// out of the `source` node's `{"input": ..., "trigger": ...}` wrapper shape.
struct SentimentProvider;

#[async_trait]
impl AiProvider for SentimentProvider {
    fn name(&self) -> &str {
        "sentiment"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, EngineError> {
        let text = request.input["input"]["text"].clone();
        Ok(ChatOutcome {
            chunks: vec![StreamChunk::Token("positive".into()), StreamChunk::Token(" (0.92)".into())],
            output: serde_json::json!({ "sentiment": "positive", "confidence": 0.92, "text": text }),
            tokens_input: 4,
            tokens_output: 2,
        })
    }
}

/// Sleeps before returning its (never-observed) chunks, used to hold the
/// provider call itself in flight long enough for a test to cancel mid-call.
struct SlowStreamingProvider {
    delay: Duration,
}

#[async_trait]
impl AiProvider for SlowStreamingProvider {
    fn name(&self) -> &str {
        "slow-stream"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, EngineError> {
        tokio::time::sleep(self.delay).await;
        Ok(ChatOutcome {
            chunks: vec![
                StreamChunk::Token("this".into()),
                StreamChunk::Token(" should".into()),
                StreamChunk::Token(" never".into()),
                StreamChunk::Token(" be".into()),
                StreamChunk::Token(" forwarded".into()),
            ],
            output: serde_json::json!({ "echo": request.input }),
            tokens_input: 1,
            tokens_output: 5,
        })
    }
}

/// Always fails with a non-retryable error, so each `submit()` trips exactly
/// one circuit-breaker failure regardless of retry policy.
struct AlwaysAuthFailProvider {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl AiProvider for AlwaysAuthFailProvider {
    fn name(&self) -> &str {
        "always-fails"
    }

    async fn chat(&self, _request: ChatRequest) -> Result<ChatOutcome, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::new(ErrorKind::ProviderAuthFailed, "bad key"))
    }
}

fn build_orchestrator(
    ai_provider: Arc<dyn AiProvider>,
    sandbox: Arc<dyn SandboxRunner>,
    config: EngineConfig,
) -> (FlowOrchestrator, Arc<InMemoryFlowStore>, Arc<InMemoryStore>, Arc<flowforge::event::InMemoryEventStore>) {
    let flow_store = Arc::new(InMemoryFlowStore::new());
    let store = Arc::new(InMemoryStore::new());
    let event_store = Arc::new(flowforge::event::InMemoryEventStore::new());
    let orchestrator = FlowOrchestrator::new(
        flow_store.clone(),
        store.clone() as Arc<dyn ExecutionStore>,
        store.clone() as Arc<dyn BlockExecutionStore>,
        event_store.clone(),
        ai_provider,
        sandbox,
        config,
    );
    (orchestrator, flow_store, store, event_store)
}

async fn wait_for_terminal(store: &InMemoryStore, execution_id: Uuid) -> Execution {
    for _ in 0..300 {
        if let Some(execution) = store.get(execution_id).await.unwrap() {
            if execution.status.is_terminal() {
                return execution;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution did not reach a terminal state in time");
}

fn single_ai_node_flow() -> Flow {
    let mut nodes = HashMap::new();
    nodes.insert("ai".to_string(), {
        let mut n = node("ai", NodeKind::Ai);
        n.data = serde_json::json!({ "executionMode": "ai_only", "provider": "flaky", "model": "m" });
        n
    });
    Flow { id: "ai-flow".into(), version: 1, name: "ai-flow".into(), nodes, edges: Vec::new() }
}

#[tokio::test]
async fn provider_rate_limit_is_retried_then_succeeds() {
    let calls = Arc::new(AtomicU32::new(0));
    let provider = Arc::new(FlakyProvider { calls: calls.clone(), fail_times: 2 });

    let mut config = EngineConfig::default();
    config.retry = RetryPolicy { max_attempts: 3, initial_delay_ms: 1, max_delay_ms: 2, backoff_multiplier: 1.0, retry_auth_failures: false };

    let (orchestrator, flow_store, store, _events) = build_orchestrator(provider, Arc::new(NoopSandbox), config);
    flow_store.insert(single_ai_node_flow());

    let execution_id = orchestrator.submit("ai-flow", 1, Value::Null, Trigger::Manual { subject_id: None }).await.unwrap();
    let execution = wait_for_terminal(&store, execution_id).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3, "two failures plus the succeeding third attempt");
}

#[tokio::test]
async fn circuit_opens_after_threshold_then_half_opens_after_reset_timeout() {
    let calls = Arc::new(AtomicU32::new(0));
    let provider = Arc::new(AlwaysAuthFailProvider { calls: calls.clone() });

    let mut config = EngineConfig::default();
    config.retry = RetryPolicy::no_retry();
    config.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 2,
        reset_timeout: Duration::from_millis(200),
        ..CircuitBreakerConfig::default()
    };

    let (orchestrator, flow_store, store, _events) = build_orchestrator(provider, Arc::new(NoopSandbox), config);
    flow_store.insert(single_ai_node_flow());

    // Two failing executions trip the breaker open (failure_threshold = 2).
    for _ in 0..2 {
        let id = orchestrator.submit("ai-flow", 1, Value::Null, Trigger::Manual { subject_id: None }).await.unwrap();
        let execution = wait_for_terminal(&store, id).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // A third execution arrives while the breaker is OPEN: the provider is
    // never called, and the failure is CIRCUIT_OPEN rather than the provider's
    // own error kind.
    let id = orchestrator.submit("ai-flow", 1, Value::Null, Trigger::Manual { subject_id: None }).await.unwrap();
    let execution = wait_for_terminal(&store, id).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.unwrap()["kind"], "CIRCUIT_OPEN");
    assert_eq!(calls.load(Ordering::SeqCst), 2, "the breaker must short-circuit before reaching the provider");

    // After reset_timeout elapses the breaker allows a HALF_OPEN probe, which
    // reaches the provider again (and fails again, since it always fails).
    tokio::time::sleep(Duration::from_millis(300)).await;
    let id = orchestrator.submit("ai-flow", 1, Value::Null, Trigger::Manual { subject_id: None }).await.unwrap();
    wait_for_terminal(&store, id).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3, "the half-open probe must reach the provider exactly once");
}

#[tokio::test]
async fn cancellation_mid_flow_stops_before_the_next_node_runs() {
    let sandbox = Arc::new(SlowSandbox { delay: Duration::from_millis(200) });
    let (orchestrator, flow_store, store, _events) = build_orchestrator(Arc::new(UnusedProvider), sandbox, EngineConfig::default());

    let mut nodes = HashMap::new();
    nodes.insert("src".to_string(), node("src", NodeKind::Source));
    nodes.insert("slow".to_string(), function_node("slow"));
    nodes.insert("fn2".to_string(), function_node("fn2"));
    nodes.insert("sink".to_string(), node("sink", NodeKind::Sink { sink_type: SinkType::Output }));
    let flow = Flow {
        id: "cancel-flow".into(),
        version: 1,
        name: "cancel-flow".into(),
        nodes,
        edges: vec![edge("src", "slow"), edge("slow", "fn2"), edge("fn2", "sink")],
    };
    flow_store.insert(flow);

    let execution_id = orchestrator
        .submit("cancel-flow", 1, serde_json::json!({"x": 1}), Trigger::Manual { subject_id: None })
        .await
        .unwrap();

    // "slow" is still sleeping at this point (its delay is 200ms); cancel now.
    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.cancel(execution_id).await.unwrap();

    let execution = wait_for_terminal(&store, execution_id).await;
    assert_eq!(execution.status, ExecutionStatus::Cancelled);

    let blocks = store.list_for_execution(execution_id).await.unwrap();
    assert!(blocks.iter().any(|b| b.node_id == "slow"), "the in-flight node should still finish");
    assert!(!blocks.iter().any(|b| b.node_id == "fn2"), "fn2 must never be dispatched after cancellation");
    assert!(!blocks.iter().any(|b| b.node_id == "sink"), "sink must never be dispatched after cancellation");
}

#[tokio::test]
async fn replay_after_a_dropped_subscriber_returns_the_full_history() {
    let (orchestrator, flow_store, store, _events) =
        build_orchestrator(Arc::new(UnusedProvider), Arc::new(NoopSandbox), EngineConfig::default());

    let mut nodes = HashMap::new();
    nodes.insert("src".to_string(), node("src", NodeKind::Source));
    nodes.insert("sink".to_string(), node("sink", NodeKind::Sink { sink_type: SinkType::Output }));
    let flow = Flow { id: "replay-flow".into(), version: 1, name: "replay-flow".into(), nodes, edges: vec![edge("src", "sink")] };
    flow_store.insert(flow);

    let execution_id = orchestrator
        .submit("replay-flow", 1, serde_json::json!({"x": 1}), Trigger::Manual { subject_id: None })
        .await
        .unwrap();

    // Subscribe, observe the early part of the stream, then drop the receiver
    // entirely (simulating a disconnected client) before the execution ends.
    {
        let (_history, mut receiver) = orchestrator.subscribe(execution_id, 0).await.unwrap();
        let _ = tokio::time::timeout(Duration::from_millis(20), receiver.recv()).await;
    }

    wait_for_terminal(&store, execution_id).await;

    let history = orchestrator.replay(execution_id, 0).await.unwrap();
    assert!(!history.is_empty());
    let indices: Vec<u64> = history.iter().map(|e| e.index).collect();
    let expected: Vec<u64> = (0..history.len() as u64).collect();
    assert_eq!(indices, expected, "replayed history must be gap-free from index 0");
    assert_eq!(history.first().unwrap().kind, EventKind::ExecutionStart);
    assert_eq!(history.last().unwrap().kind, EventKind::ExecutionComplete);
}

#[tokio::test]
async fn linear_sentiment_flow_streams_tokens_and_completes() {
    let (orchestrator, flow_store, store, _events) =
        build_orchestrator(Arc::new(SentimentProvider), Arc::new(NoopSandbox), EngineConfig::default());

    let mut nodes = HashMap::new();
    nodes.insert("src".to_string(), node("src", NodeKind::Source));
    nodes.insert("ai".to_string(), {
        let mut n = node("ai", NodeKind::Ai);
        n.data = serde_json::json!({ "executionMode": "ai_only", "provider": "sentiment", "model": "m" });
        n
    });
    nodes.insert("wrap".to_string(), function_node("wrap"));
    nodes.insert("sink".to_string(), node("sink", NodeKind::Sink { sink_type: SinkType::Output }));
    let flow = Flow {
        id: "sentiment-flow".into(),
        version: 1,
        name: "sentiment-flow".into(),
        nodes,
        edges: vec![edge("src", "ai"), edge("ai", "wrap"), edge("wrap", "sink")],
    };
    flow_store.insert(flow);

    let execution_id = orchestrator
        .submit("sentiment-flow", 1, serde_json::json!({"text": "I love this"}), Trigger::Manual { subject_id: None })
        .await
        .unwrap();

    let execution = wait_for_terminal(&store, execution_id).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let output = execution.output.unwrap();
    assert_eq!(output["output"]["sentiment"], "positive");
    assert_eq!(output["output"]["text"], "I love this");

    let history = orchestrator.replay(execution_id, 0).await.unwrap();
    let node_starts = history.iter().filter(|e| e.kind == EventKind::NodeStart).count();
    let node_completes = history.iter().filter(|e| e.kind == EventKind::NodeComplete).count();
    assert_eq!(node_starts, 4, "source, ai, function and sink are each dispatched and instrumented");
    assert_eq!(node_completes, 4);

    let stream_events: Vec<_> = history.iter().filter(|e| e.kind == EventKind::NodeStream).collect();
    assert_eq!(stream_events.len(), 2, "the ai node's two streamed tokens must land in the event log");
    assert_eq!(stream_events[0].payload["event"]["value"], "positive");
}

#[tokio::test]
async fn cancellation_during_an_in_flight_ai_call_stops_streaming_before_any_token_is_forwarded() {
    let provider = Arc::new(SlowStreamingProvider { delay: Duration::from_millis(150) });
    let (orchestrator, flow_store, store, _events) = build_orchestrator(provider, Arc::new(NoopSandbox), EngineConfig::default());

    let mut nodes = HashMap::new();
    nodes.insert("ai".to_string(), {
        let mut n = node("ai", NodeKind::Ai);
        n.data = serde_json::json!({ "executionMode": "ai_only", "provider": "slow-stream", "model": "m" });
        n
    });
    let flow = Flow { id: "cancel-stream-flow".into(), version: 1, name: "cancel-stream-flow".into(), nodes, edges: Vec::new() };
    flow_store.insert(flow);

    let execution_id = orchestrator
        .submit("cancel-stream-flow", 1, serde_json::json!({"text": "hi"}), Trigger::Manual { subject_id: None })
        .await
        .unwrap();

    // The provider is still asleep at this point (its delay is 150ms); cancel now,
    // well before `chat()` returns its buffered chunks.
    tokio::time::sleep(Duration::from_millis(30)).await;
    orchestrator.cancel(execution_id).await.unwrap();

    let execution = wait_for_terminal(&store, execution_id).await;
    assert_eq!(execution.status, ExecutionStatus::Cancelled);

    let history = orchestrator.replay(execution_id, 0).await.unwrap();
    assert!(
        !history.iter().any(|e| e.kind == EventKind::NodeStream),
        "cancellation observed before the first buffered chunk must suppress the whole stream, not just the tail"
    );
    assert_eq!(history.last().unwrap().kind, EventKind::ExecutionCancelled);
}
