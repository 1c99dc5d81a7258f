//! Source executor: passes through the flow input with trigger metadata.

use async_trait::async_trait;
use serde_json::Value;

use super::{ExecutorContext, ExecutorOutput, NodeExecutor};
use crate::error::EngineError;
use crate::model::flow::Node;

pub struct SourceExecutor;

#[async_trait]
impl NodeExecutor for SourceExecutor {
    async fn execute(&self, _node: &Node, _input: Value, ctx: &ExecutorContext) -> Result<ExecutorOutput, EngineError> {
        ctx.check_cancelled()?;
        Ok(ExecutorOutput::Value(serde_json::json!({
            "input": ctx.flow_input,
            "trigger": ctx.trigger,
        })))
    }
}
