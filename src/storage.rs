//! Storage contracts: the engine's view of persistence for Executions and
//! BlockExecutions (the Event log has its own contract, [`crate::event::EventStore`]).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::model::flow::Flow;
use crate::model::{BlockExecution, Execution};

/// A flow as loaded from storage, plus the soft-delete flag the orchestrator
/// consults at submit time to reject deleted flow versions.
#[derive(Debug, Clone)]
pub struct StoredFlow {
    pub flow: Flow,
    pub soft_deleted: bool,
}

#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn get(&self, flow_id: &str, version: u32) -> Result<Option<StoredFlow>, String>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert(&self, execution: Execution) -> Result<(), String>;
    async fn update(&self, execution: Execution) -> Result<(), String>;
    async fn get(&self, execution_id: Uuid) -> Result<Option<Execution>, String>;
}

#[async_trait]
pub trait BlockExecutionStore: Send + Sync {
    async fn upsert(&self, block_execution: BlockExecution) -> Result<(), String>;
    async fn list_for_execution(&self, execution_id: Uuid) -> Result<Vec<BlockExecution>, String>;
}

/// In-memory reference implementation of both stores, keyed by id.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    executions: Arc<DashMap<Uuid, Execution>>,
    block_executions: Arc<DashMap<Uuid, BlockExecution>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// In-memory `FlowStore` keyed by `(flow_id, version)`, for tests and
/// single-process deployments.
#[derive(Default, Clone)]
pub struct InMemoryFlowStore {
    flows: Arc<DashMap<(String, u32), StoredFlow>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, flow: Flow) {
        let key = (flow.id.clone(), flow.version);
        self.flows.insert(key, StoredFlow { flow, soft_deleted: false });
    }

    pub fn soft_delete(&self, flow_id: &str, version: u32) {
        if let Some(mut entry) = self.flows.get_mut(&(flow_id.to_string(), version)) {
            entry.soft_deleted = true;
        }
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn get(&self, flow_id: &str, version: u32) -> Result<Option<StoredFlow>, String> {
        Ok(self.flows.get(&(flow_id.to_string(), version)).map(|e| e.clone()))
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn insert(&self, execution: Execution) -> Result<(), String> {
        self.executions.insert(execution.execution_id, execution);
        Ok(())
    }

    async fn update(&self, execution: Execution) -> Result<(), String> {
        self.executions.insert(execution.execution_id, execution);
        Ok(())
    }

    async fn get(&self, execution_id: Uuid) -> Result<Option<Execution>, String> {
        Ok(self.executions.get(&execution_id).map(|e| e.clone()))
    }
}

#[async_trait]
impl BlockExecutionStore for InMemoryStore {
    async fn upsert(&self, block_execution: BlockExecution) -> Result<(), String> {
        self.block_executions.insert(block_execution.id, block_execution);
        Ok(())
    }

    async fn list_for_execution(&self, execution_id: Uuid) -> Result<Vec<BlockExecution>, String> {
        Ok(self
            .block_executions
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .map(|e| e.clone())
            .collect())
    }
}
