//! Function executor: sandboxed user code, retried up to twice.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{ExecutorContext, ExecutorOutput, NodeExecutor};
use crate::error::{EngineError, ErrorKind};
use crate::model::flow::Node;
use crate::retry::{retry, RetryPolicy};
use crate::sandbox::SandboxLimits;

pub struct FunctionExecutor;

#[async_trait]
impl NodeExecutor for FunctionExecutor {
    async fn execute(&self, node: &Node, input: Value, ctx: &ExecutorContext) -> Result<ExecutorOutput, EngineError> {
        ctx.check_cancelled()?;
        let code = node
            .data
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::new(ErrorKind::ValidationFailed, "function node is missing its code"))?
            .to_string();

        let limits = SandboxLimits {
            timeout_ms: ctx.config.timeouts.sandbox_default_ms,
            ..Default::default()
        };

        let policy = RetryPolicy::function_default();
        let sandbox = ctx.sandbox.clone();
        let cancel: CancellationToken = ctx.cancel.clone();
        let node_id = node.node_id.clone();

        let result = retry(
            &policy,
            &cancel,
            |_err, _attempt, _delay| {},
            |_attempt| {
                let sandbox = sandbox.clone();
                let code = code.clone();
                let input = input.clone();
                let limits = limits.clone();
                async move { sandbox.run(&code, input, &limits).await }
            },
        )
        .await;

        result
            .map(|out| ExecutorOutput::Value(out.result))
            .map_err(|err| err.with_context(crate::error::ErrorContext::default().with_node(node_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::test_support::test_ctx;
    use crate::model::flow::NodeKind;

    #[tokio::test]
    async fn runs_code_against_input() {
        let node = Node {
            node_id: "fn".into(),
            kind: NodeKind::Function,
            data: serde_json::json!({ "code": "input" }),
        };
        let ctx = test_ctx(Value::Null);
        let out = FunctionExecutor.execute(&node, serde_json::json!({"x": 1}), &ctx).await.unwrap().into_value();
        assert_eq!(out["x"], 1);
    }

    #[tokio::test]
    async fn missing_code_is_validation_failed() {
        let node = Node { node_id: "fn".into(), kind: NodeKind::Function, data: serde_json::json!({}) };
        let ctx = test_ctx(Value::Null);
        let err = FunctionExecutor.execute(&node, Value::Null, &ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationFailed);
    }
}
