//! The AI provider wire contract: an external collaborator whose calls are
//! treated as opaque. Implementations wrap a concrete vendor SDK; this crate
//! ships none and tests against a scripted mock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub provider: String,
    pub model: String,
    pub input: Value,
}

/// One chunk of a streamed response. The AI executor forwards each chunk as a
/// `node_stream` event before the call completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamChunk {
    Token(String),
    ToolCall(Value),
}

/// The outcome of one `chat` call: the buffered stream chunks (forwarded as
/// `node_stream` events in emission order) plus the final structured output.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub chunks: Vec<StreamChunk>,
    pub output: Value,
    pub tokens_input: u64,
    pub tokens_output: u64,
}

/// What the AI executor depends on. `status_code`, when an error occurs, drives
/// [`crate::error::adapt`]'s classification.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, EngineError>;
}
