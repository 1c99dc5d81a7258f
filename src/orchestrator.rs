//! Flow orchestrator: compiles a flow, drives it node by node in
//! topological order, and streams progress through the event substrate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind};
use crate::event::{EventEmitter, EventRecord, EventStore, FlowEventAggregator};
use crate::executors::{AiProvider, ExecutorContext, ExecutorOutput, ExecutorRegistry};
use crate::fallback::FallbackTracker;
use crate::model::flow::{Edge, Flow, Node, NodeId};
use crate::model::{BlockExecution, Execution, ExecutionStatus, NodeStatus, Trigger};
use crate::sandbox::SandboxRunner;
use crate::state_machine::StatusTracker;
use crate::storage::{BlockExecutionStore, ExecutionStore, FlowStore};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Dependencies shared by every execution this orchestrator drives.
struct OrchestratorShared {
    executors: ExecutorRegistry,
    breaker_registry: Arc<CircuitBreakerRegistry>,
    sandbox: Arc<dyn SandboxRunner>,
    ai_provider: Arc<dyn AiProvider>,
    fallback_tracker: FallbackTracker,
    config: EngineConfig,
}

/// Per-execution state threaded through recursive node dispatch (also reached
/// via a node's `ctx.run_node` closure for router/parallel/loop).
struct RunContext {
    execution_id: Uuid,
    flow: Arc<Flow>,
    flow_input: Value,
    trigger: Value,
    node_results: Arc<DashMap<NodeId, Value>>,
    cancel: CancellationToken,
    aggregator: FlowEventAggregator,
    fallback_tracker: FallbackTracker,
    block_store: Arc<dyn BlockExecutionStore>,
}

/// Compiles flows, drives executions to completion, and exposes subscribe/cancel.
pub struct FlowOrchestrator {
    shared: Arc<OrchestratorShared>,
    flow_store: Arc<dyn FlowStore>,
    execution_store: Arc<dyn ExecutionStore>,
    block_store: Arc<dyn BlockExecutionStore>,
    event_store: Arc<dyn EventStore>,
    cancel_tokens: Arc<DashMap<Uuid, CancellationToken>>,
    aggregators: Arc<DashMap<Uuid, FlowEventAggregator>>,
}

impl FlowOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flow_store: Arc<dyn FlowStore>,
        execution_store: Arc<dyn ExecutionStore>,
        block_store: Arc<dyn BlockExecutionStore>,
        event_store: Arc<dyn EventStore>,
        ai_provider: Arc<dyn AiProvider>,
        sandbox: Arc<dyn SandboxRunner>,
        config: EngineConfig,
    ) -> Self {
        let breaker_registry = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        Self {
            shared: Arc::new(OrchestratorShared {
                executors: ExecutorRegistry::new(),
                breaker_registry,
                sandbox,
                ai_provider,
                fallback_tracker: FallbackTracker::new(),
                config,
            }),
            flow_store,
            execution_store,
            block_store,
            event_store,
            cancel_tokens: Arc::new(DashMap::new()),
            aggregators: Arc::new(DashMap::new()),
        }
    }

    /// Load + compile the flow, persist a pending execution, and spawn the
    /// driver task.
    pub async fn submit(&self, flow_id: &str, flow_version: u32, input: Value, trigger: Trigger) -> Result<Uuid, EngineError> {
        let stored = self
            .flow_store
            .get(flow_id, flow_version)
            .await
            .map_err(|e| EngineError::new(ErrorKind::ResourceNotFound, format!("flow store error: {e}")))?
            .ok_or_else(|| EngineError::new(ErrorKind::ResourceNotFound, format!("flow not found: {flow_id}@{flow_version}")))?;

        if stored.soft_deleted {
            return Err(EngineError::new(
                ErrorKind::ResourceNotFound,
                format!("flow {flow_id}@{flow_version} has been deleted"),
            ));
        }

        let flow = Arc::new(stored.flow);
        let topo = flow
            .topological_order()
            .map_err(crate::error::FlowCompileError)
            .map_err(|e| EngineError::execution_failed(e.to_string()))?;

        let mut execution = Execution::new_pending(flow_id, flow_version, input, trigger);
        let execution_id = execution.execution_id;
        execution.metrics.set_node_count(topo.len() as u32);
        self.execution_store
            .insert(execution.clone())
            .await
            .map_err(|e| EngineError::new(ErrorKind::ResourceNotFound, format!("execution store error: {e}")))?;

        let emitter = EventEmitter::new(execution_id, self.event_store.clone());
        let aggregator = FlowEventAggregator::new(emitter);
        self.aggregators.insert(execution_id, aggregator.clone());

        let cancel = CancellationToken::new();
        self.cancel_tokens.insert(execution_id, cancel.clone());

        let shared = self.shared.clone();
        let execution_store = self.execution_store.clone();
        let block_store = self.block_store.clone();

        tokio::spawn(run_execution(shared, execution_store, block_store, flow, topo, execution, aggregator, cancel));

        Ok(execution_id)
    }

    /// Replay from `from_index` and attach a live receiver.
    pub async fn subscribe(&self, execution_id: Uuid, from_index: u64) -> Result<(Vec<EventRecord>, broadcast::Receiver<EventRecord>), EngineError> {
        let aggregator = self
            .aggregators
            .get(&execution_id)
            .ok_or_else(|| EngineError::new(ErrorKind::ResourceNotFound, format!("no such execution: {execution_id}")))?;
        Ok(aggregator.emitter().subscribe_from(from_index).await)
    }

    pub async fn replay(&self, execution_id: Uuid, from_index: u64) -> Result<Vec<EventRecord>, EngineError> {
        let aggregator = self
            .aggregators
            .get(&execution_id)
            .ok_or_else(|| EngineError::new(ErrorKind::ResourceNotFound, format!("no such execution: {execution_id}")))?;
        Ok(aggregator.emitter().replay(from_index).await)
    }

    /// Mark the abort signal and transition to cancelled if not already
    /// terminal; rejects already-terminal executions with a 409-equivalent error.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let execution = self
            .execution_store
            .get(execution_id)
            .await
            .map_err(|e| EngineError::new(ErrorKind::ResourceNotFound, format!("execution store error: {e}")))?
            .ok_or_else(|| EngineError::new(ErrorKind::ResourceNotFound, format!("no such execution: {execution_id}")))?;

        if execution.status.is_terminal() {
            return Err(EngineError::new(
                ErrorKind::ValidationFailed,
                format!("execution {execution_id} is already {:?} and cannot be cancelled", execution.status),
            ));
        }

        let cancel = self
            .cancel_tokens
            .get(&execution_id)
            .ok_or_else(|| EngineError::new(ErrorKind::ResourceNotFound, format!("no such execution: {execution_id}")))?;
        cancel.cancel();
        Ok(())
    }
}

async fn run_execution(
    shared: Arc<OrchestratorShared>,
    execution_store: Arc<dyn ExecutionStore>,
    block_store: Arc<dyn BlockExecutionStore>,
    flow: Arc<Flow>,
    topo: Vec<NodeId>,
    mut execution: Execution,
    aggregator: FlowEventAggregator,
    cancel: CancellationToken,
) {
    let execution_id = execution.execution_id;
    let mut tracker = StatusTracker::new();

    if let Err(err) = tracker.transition(ExecutionStatus::Running, now_ms()) {
        error!(%execution_id, %err, "unreachable: pending execution failed to transition to running");
        return;
    }
    execution.status = ExecutionStatus::Running;
    execution.started_at_ms = tracker.started_at_ms;
    if let Err(err) = execution_store.update(execution.clone()).await {
        warn!(%execution_id, %err, "failed to persist running transition");
    }
    aggregator.execution_start(&flow.id, &execution.input).await;
    info!(%execution_id, flow_id = %flow.id, node_count = topo.len(), "execution started");

    let run = Arc::new(RunContext {
        execution_id,
        flow: flow.clone(),
        flow_input: execution.input.clone(),
        trigger: serde_json::to_value(&execution.triggered_by).unwrap_or(Value::Null),
        node_results: Arc::new(DashMap::new()),
        cancel: cancel.clone(),
        aggregator: aggregator.clone(),
        fallback_tracker: shared.fallback_tracker.clone(),
        block_store: block_store.clone(),
    });

    let mut node_outputs: HashMap<NodeId, Value> = HashMap::new();
    let mut route_selection: HashMap<NodeId, NodeId> = HashMap::new();
    let mut skipped: HashSet<NodeId> = HashSet::new();

    for node_id in &topo {
        if cancel.is_cancelled() {
            finish_cancelled(execution, tracker, execution_store.as_ref(), &aggregator, execution_id).await;
            return;
        }

        let node = flow.nodes.get(node_id).expect("topological_order only yields known node ids");
        let incoming = flow.incoming_edges(node_id);

        let input = if incoming.is_empty() {
            execution.input.clone()
        } else {
            let active: Vec<&Edge> = incoming.into_iter().filter(|e| is_edge_active(e, &skipped, &route_selection)).collect();
            if active.is_empty() {
                skipped.insert(node_id.clone());
                let node_emitter = aggregator.node_emitter(node_id.clone(), Uuid::new_v4());
                node_emitter.skipped("no active upstream edge (excluded branch)").await;
                continue;
            }
            merge_inputs(&active, &node_outputs)
        };

        match dispatch_node(shared.clone(), run.clone(), node.clone(), input).await {
            Ok(ExecutorOutput::Value(value)) => {
                node_outputs.insert(node_id.clone(), value);
                execution.metrics.inc_completed_nodes();
            }
            Ok(ExecutorOutput::Route { target_node_id, input: route_input, .. }) => {
                node_outputs.insert(node_id.clone(), route_input);
                route_selection.insert(node_id.clone(), target_node_id);
                execution.metrics.inc_completed_nodes();
            }
            Err(err) if err.kind == ErrorKind::ExecutionCancelled => {
                finish_cancelled(execution, tracker, execution_store.as_ref(), &aggregator, execution_id).await;
                return;
            }
            Err(err) => {
                execution.metrics.inc_failed_nodes();
                finish_failed(execution, tracker, execution_store.as_ref(), &aggregator, execution_id, err).await;
                return;
            }
        }
    }

    let output = collect_outputs(&flow, &node_outputs, &skipped);
    finish_completed(execution, tracker, execution_store.as_ref(), &aggregator, execution_id, output).await;
}

fn is_edge_active(edge: &Edge, skipped: &HashSet<NodeId>, route_selection: &HashMap<NodeId, NodeId>) -> bool {
    if skipped.contains(&edge.source_node_id) {
        return false;
    }
    match route_selection.get(&edge.source_node_id) {
        Some(selected) => *selected == edge.target_node_id,
        None => true,
    }
}

/// Single active edge: pass the upstream output through. Multiple: key by
/// `sourceHandle ?? sourceId`.
fn merge_inputs(active: &[&Edge], node_outputs: &HashMap<NodeId, Value>) -> Value {
    if active.len() == 1 {
        return node_outputs.get(&active[0].source_node_id).cloned().unwrap_or(Value::Null);
    }
    let mut map = serde_json::Map::new();
    for edge in active {
        let key = edge.source_handle.clone().unwrap_or_else(|| edge.source_node_id.clone());
        map.insert(key, node_outputs.get(&edge.source_node_id).cloned().unwrap_or(Value::Null));
    }
    Value::Object(map)
}

/// Single sink -> its result; multiple sinks -> a mapping keyed by the sink's
/// `label` (falling back to its node id).
fn collect_outputs(flow: &Flow, node_outputs: &HashMap<NodeId, Value>, skipped: &HashSet<NodeId>) -> Value {
    let sinks: Vec<&NodeId> = flow.sink_node_ids().into_iter().filter(|id| !skipped.contains(*id)).collect();
    match sinks.as_slice() {
        [] => Value::Null,
        [only] => node_outputs.get(*only).cloned().unwrap_or(Value::Null),
        many => {
            let mut map = serde_json::Map::new();
            for sink_id in many {
                let node = &flow.nodes[*sink_id];
                let key = node.data.get("label").and_then(Value::as_str).map(str::to_string).unwrap_or_else(|| (*sink_id).clone());
                map.insert(key, node_outputs.get(*sink_id).cloned().unwrap_or(Value::Null));
            }
            Value::Object(map)
        }
    }
}

async fn finish_completed(mut execution: Execution, mut tracker: StatusTracker, execution_store: &dyn ExecutionStore, aggregator: &FlowEventAggregator, execution_id: Uuid, output: Value) {
    let now = now_ms();
    if tracker.transition(ExecutionStatus::Completed, now).is_err() {
        error!(%execution_id, "unreachable: running execution failed to transition to completed");
        return;
    }
    execution.status = ExecutionStatus::Completed;
    execution.completed_at_ms = tracker.completed_at_ms;
    execution.metrics.total_duration_ms = tracker.total_duration_ms();
    execution.output = Some(output.clone());
    if let Err(err) = execution_store.update(execution.clone()).await {
        warn!(%execution_id, %err, "failed to persist completed transition");
    }
    let metrics_value = serde_json::to_value(&execution.metrics).unwrap_or(Value::Null);
    aggregator.execution_complete(&output, &metrics_value).await;
    aggregator.close();
    info!(%execution_id, "execution completed");
}

async fn finish_failed(mut execution: Execution, mut tracker: StatusTracker, execution_store: &dyn ExecutionStore, aggregator: &FlowEventAggregator, execution_id: Uuid, err: EngineError) {
    let now = now_ms();
    if tracker.transition(ExecutionStatus::Failed, now).is_err() {
        error!(%execution_id, "unreachable: running execution failed to transition to failed");
        return;
    }
    execution.status = ExecutionStatus::Failed;
    execution.completed_at_ms = tracker.completed_at_ms;
    execution.metrics.total_duration_ms = tracker.total_duration_ms();
    let error_value = serde_json::to_value(&err).unwrap_or(Value::Null);
    execution.error = Some(error_value.clone());
    if let Err(store_err) = execution_store.update(execution.clone()).await {
        warn!(%execution_id, %store_err, "failed to persist failed transition");
    }
    aggregator.execution_error(&error_value).await;
    aggregator.close();
    warn!(%execution_id, %err, "execution failed");
}

async fn finish_cancelled(mut execution: Execution, mut tracker: StatusTracker, execution_store: &dyn ExecutionStore, aggregator: &FlowEventAggregator, execution_id: Uuid) {
    let now = now_ms();
    if tracker.transition(ExecutionStatus::Cancelled, now).is_err() {
        // Already terminal: cancellation lost the race, nothing to do.
        return;
    }
    execution.status = ExecutionStatus::Cancelled;
    execution.completed_at_ms = tracker.completed_at_ms;
    if let Err(err) = execution_store.update(execution.clone()).await {
        warn!(%execution_id, %err, "failed to persist cancelled transition");
    }
    aggregator.execution_cancelled().await;
    aggregator.close();
    info!(%execution_id, "execution cancelled");
}

/// Invokes a single node's executor: builds its `ExecutorContext` (including a
/// `run_node` closure that recurses back into this function), emits
/// `node_start`/`node_complete`/`node_error`, and persists the `BlockExecution`
/// row across its running -> terminal transition.
fn dispatch_node(shared: Arc<OrchestratorShared>, run: Arc<RunContext>, node: Node, input: Value) -> BoxFuture<'static, Result<ExecutorOutput, EngineError>> {
    Box::pin(async move {
        if run.cancel.is_cancelled() {
            return Err(EngineError::cancelled());
        }

        let block_execution_id = Uuid::new_v4();
        let started_at = now_ms();
        let node_emitter = run.aggregator.node_emitter(node.node_id.clone(), block_execution_id);
        node_emitter.start(&node.kind.tag().to_string(), &input).await;

        let mut block = BlockExecution::new_running(run.execution_id, node.node_id.clone(), input.clone(), started_at);
        if let Err(err) = run.block_store.upsert(block.clone()).await {
            warn!(node_id = %node.node_id, %err, "failed to persist running block execution");
        }

        let run_node_closure: Arc<dyn Fn(NodeId, Value) -> BoxFuture<'static, Result<Value, EngineError>> + Send + Sync> = {
            let shared = shared.clone();
            let run = run.clone();
            Arc::new(move |target_node_id: NodeId, nested_input: Value| {
                let shared = shared.clone();
                let run = run.clone();
                Box::pin(async move {
                    let target = run.flow.nodes.get(&target_node_id).cloned().ok_or_else(|| EngineError::node_not_found(target_node_id))?;
                    dispatch_node(shared, run, target, nested_input).await.map(ExecutorOutput::into_value)
                })
            })
        };

        let ctx = ExecutorContext {
            execution_id: run.execution_id,
            flow: run.flow.clone(),
            flow_input: run.flow_input.clone(),
            trigger: run.trigger.clone(),
            node_results: run.node_results.clone(),
            cancel: run.cancel.clone(),
            emitter: node_emitter.clone(),
            breaker_registry: shared.breaker_registry.clone(),
            sandbox: shared.sandbox.clone(),
            ai_provider: shared.ai_provider.clone(),
            fallback_tracker: run.fallback_tracker.clone(),
            config: shared.config.clone(),
            block_execution_id,
            run_node: run_node_closure,
        };

        let executor = shared.executors.get(node.kind.tag())?;
        let result = executor.execute(&node, input, &ctx).await;

        let completed_at = now_ms();
        let duration_ms = (completed_at - started_at).max(0) as u64;
        block.completed_at_ms = Some(completed_at);
        block.duration_ms = Some(duration_ms);

        if let Some(record) = run.fallback_tracker.get(block_execution_id) {
            block.execution_path = Some(record.path_taken);
            block.fallback_reason = record.fallback_reason;
        }

        match &result {
            Ok(output) => {
                let value = output.clone().into_value();
                block.status = NodeStatus::Completed;
                block.output = Some(value.clone());
                node_emitter.complete(&value, duration_ms).await;
            }
            Err(err) => {
                let error_value = serde_json::to_value(err).unwrap_or(Value::Null);
                block.status = NodeStatus::Failed;
                block.error = Some(error_value.clone());
                node_emitter.error(&error_value).await;
            }
        }

        if let Err(err) = run.block_store.upsert(block).await {
            warn!(node_id = %node.node_id, %err, "failed to persist terminal block execution");
        }

        result
    })
}
