//! AI executor: consults the hybrid router, then runs the code path (sandboxed)
//! or the AI path wrapped in a circuit breaker + retry.

use async_trait::async_trait;
use serde_json::Value;

use super::provider::{ChatRequest, StreamChunk};
use super::{ExecutorContext, ExecutorOutput, NodeExecutor};
use crate::error::{adapt, EngineError};
use crate::model::flow::Node;
use crate::model::ExecutionPath;
use crate::retry::{retry, RetryPolicy};
use crate::routing::{route, ExecutionMode};
use crate::sandbox::SandboxLimits;

/// Block configuration read off `node.data`.
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiBlockConfig {
    #[serde(default = "default_mode")]
    execution_mode: ExecutionMode,
    #[serde(default)]
    generated_code: Option<String>,
    #[serde(default = "default_provider")]
    provider: String,
    #[serde(default = "default_model")]
    model: String,
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::AiOnly
}

fn default_provider() -> String {
    "default".to_string()
}

fn default_model() -> String {
    "default".to_string()
}

pub struct AiExecutor;

#[async_trait]
impl NodeExecutor for AiExecutor {
    async fn execute(&self, node: &Node, input: Value, ctx: &ExecutorContext) -> Result<ExecutorOutput, EngineError> {
        ctx.check_cancelled()?;
        let config: AiBlockConfig = serde_json::from_value(node.data.clone()).unwrap_or(AiBlockConfig {
            execution_mode: ExecutionMode::AiOnly,
            generated_code: None,
            provider: default_provider(),
            model: default_model(),
        });

        let threshold = ctx.config.hybrid.threshold_percent;
        let decision = route(config.execution_mode, config.generated_code.as_deref(), &input, &node.node_id, threshold);

        ctx.fallback_tracker.record_decision(
            ctx.block_execution_id,
            &node.node_id,
            &decision,
            match decision.path {
                crate::routing::Path::Code => ExecutionPath::Code,
                crate::routing::Path::Ai => ExecutionPath::Ai,
            },
        );

        if decision.path == crate::routing::Path::Code {
            let code = config.generated_code.clone().expect("code path implies generated_code present");
            match ctx.sandbox.run(&code, input.clone(), &SandboxLimits::hybrid_code()).await {
                Ok(output) => return Ok(ExecutorOutput::Value(output.result)),
                Err(err) => {
                    ctx.fallback_tracker.record_fallback(ctx.block_execution_id, format!("code path failed: {err}"));
                    // fall through to the AI path below
                }
            }
        }

        self.run_ai_path(node, input, &config, ctx).await
    }
}

impl AiExecutor {
    async fn run_ai_path(&self, node: &Node, input: Value, config: &AiBlockConfig, ctx: &ExecutorContext) -> Result<ExecutorOutput, EngineError> {
        let breaker = ctx.breaker_registry.get_or_create(&config.provider);
        let mut policy = ctx.config.retry.clone();
        policy.retry_auth_failures = false;

        let request = ChatRequest { provider: config.provider.clone(), model: config.model.clone(), input: input.clone() };
        let provider = ctx.ai_provider.clone();
        let emitter = ctx.emitter.clone();

        let cancel = ctx.cancel.clone();
        let result = breaker
            .execute(|| async {
                retry(
                    &policy,
                    &cancel,
                    |_err, _attempt, _delay| {},
                    |_attempt| {
                        let request = request.clone();
                        let provider = provider.clone();
                        let emitter = emitter.clone();
                        let cancel = cancel.clone();
                        async move {
                            let outcome = provider.chat(request).await.map_err(|e| adapt(e.status_code, e.message, e.provider.as_deref()))?;
                            for chunk in &outcome.chunks {
                                if cancel.is_cancelled() {
                                    return Err(EngineError::cancelled());
                                }
                                let payload = match chunk {
                                    StreamChunk::Token(t) => serde_json::json!({ "type": "token", "value": t }),
                                    StreamChunk::ToolCall(v) => serde_json::json!({ "type": "tool_call", "value": v }),
                                };
                                emitter.stream(payload).await;
                            }
                            Ok(outcome)
                        }
                    },
                )
                .await
            })
            .await;

        result.map(|outcome| ExecutorOutput::Value(outcome.output))
    }
}
