//! Parallel executor: split -> concurrent fan-out over a processor node -> merge.
//! Processor/splitter/merger identity is explicit configuration (`processorNodeId`
//! etc.) on the node, per the design decision recorded in DESIGN.md.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{ExecutorContext, ExecutorOutput, NodeExecutor};
use crate::error::EngineError;
use crate::model::flow::{Node, NodeKind};

pub struct ParallelExecutor;

#[async_trait]
impl NodeExecutor for ParallelExecutor {
    async fn execute(&self, node: &Node, input: Value, ctx: &ExecutorContext) -> Result<ExecutorOutput, EngineError> {
        ctx.check_cancelled()?;
        let NodeKind::Parallel { splitter_node_id, processor_node_id, merger_node_id, concurrency_limit } = &node.kind else {
            return Err(EngineError::execution_failed("parallel executor invoked on a non-parallel node"));
        };

        let splitter_output = if let Some(splitter) = splitter_node_id {
            (ctx.run_node)(splitter.clone(), input.clone()).await?
        } else {
            input.clone()
        };

        let chunks = split_into_chunks(&splitter_output);

        let semaphore = concurrency_limit.map(|limit| std::sync::Arc::new(Semaphore::new(limit.max(1))));

        let mut join_set: JoinSet<(usize, Result<Value, EngineError>)> = JoinSet::new();
        for (index, chunk) in chunks.into_iter().enumerate() {
            ctx.check_cancelled()?;
            let processor_node_id = processor_node_id.clone();
            let run_node = ctx.run_node.clone();
            let permit_guard = semaphore.clone();
            join_set.spawn(async move {
                let _permit = match permit_guard {
                    Some(sem) => Some(sem.acquire_owned().await.expect("semaphore not closed")),
                    None => None,
                };
                let result = run_node(processor_node_id, chunk).await;
                (index, result)
            });
        }

        let mut results: Vec<Option<Value>> = vec![None; join_set.len()];
        let mut total = results.len();
        while let Some(joined) = join_set.join_next().await {
            let (index, result) = joined.map_err(|e| EngineError::execution_failed(format!("parallel task join error: {e}")))?;
            if ctx.cancel.is_cancelled() {
                join_set.abort_all();
                return Err(EngineError::cancelled());
            }
            match result {
                Ok(value) => {
                    if index >= results.len() {
                        results.resize(index + 1, None);
                        total = results.len();
                    }
                    results[index] = Some(value);
                }
                Err(err) => {
                    join_set.abort_all();
                    return Err(err);
                }
            }
        }
        let _ = total;

        let ordered_results: Vec<Value> = results.into_iter().map(|r| r.unwrap_or(Value::Null)).collect();

        let output = if let Some(merger) = merger_node_id {
            let merger_input = serde_json::json!({ "results": ordered_results, "originalInput": input });
            (ctx.run_node)(merger.clone(), merger_input).await?
        } else {
            serde_json::json!({ "results": ordered_results, "totalChunks": ordered_results.len() })
        };

        Ok(ExecutorOutput::Value(output))
    }
}

/// Ordered chunk extraction: an array output, a `{chunks}` object, or a
/// wrapped singleton.
fn split_into_chunks(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("chunks") {
                items.clone()
            } else {
                vec![value.clone()]
            }
        }
        other => vec![other.clone()],
    }
}
