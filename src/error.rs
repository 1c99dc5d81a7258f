//! Error taxonomy: a closed set of error kinds with retry/remediation metadata.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of error kinds the engine can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Unknown,
    ExecutionFailed,
    ValidationFailed,
    InvalidInput,
    InvalidOutput,
    SchemaMismatch,
    ProviderError,
    ProviderUnavailable,
    ProviderRateLimit,
    ProviderAuthFailed,
    ProviderInvalidRequest,
    Timeout,
    ExecutionTimeout,
    NetworkError,
    ConnectionFailed,
    ResourceNotFound,
    ResourceExhausted,
    NodeNotFound,
    ExecutorNotFound,
    ExecutionCancelled,
    CircuitOpen,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "UNKNOWN".to_string());
        write!(f, "{s}")
    }
}

impl ErrorKind {
    /// Whether this kind is retryable *in principle* (the retry engine consults this, but
    /// policies may further restrict it).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkError
                | ErrorKind::ConnectionFailed
                | ErrorKind::ProviderRateLimit
                | ErrorKind::ProviderUnavailable
                | ErrorKind::Timeout
                | ErrorKind::ExecutionTimeout
                | ErrorKind::ResourceExhausted
        )
    }
}

/// Structured context attached to an [`EngineError`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    pub node_id: Option<String>,
    pub flow_id: Option<String>,
    pub execution_id: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub attempt: Option<u32>,
    pub max_attempts: Option<u32>,
    pub timestamp_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_flow(mut self, flow_id: impl Into<String>) -> Self {
        self.flow_id = Some(flow_id.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32, max_attempts: u32) -> Self {
        self.attempt = Some(attempt);
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A single validation issue attached to [`EngineError::ValidationFailed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

/// The engine's own error type. Never `#[non_exhaustive]`-free in spirit — new
/// kinds should be rare, since [`ErrorKind`] is a closed taxonomy by design.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: ErrorContext,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub issues: Vec<FieldIssue>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub breaker_name: Option<String>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: ErrorContext::default(),
            provider: None,
            status_code: None,
            issues: Vec::new(),
            timeout_ms: None,
            breaker_name: None,
        }
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionFailed, message)
    }

    pub fn validation_failed(message: impl Into<String>, issues: Vec<FieldIssue>) -> Self {
        let mut e = Self::new(ErrorKind::ValidationFailed, message);
        e.issues = issues;
        e
    }

    pub fn node_not_found(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self::new(ErrorKind::NodeNotFound, format!("node not found: {node_id}"))
            .with_context(ErrorContext::default().with_node(node_id))
    }

    pub fn executor_not_found(kind: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::ExecutorNotFound,
            format!("no executor registered for node kind: {kind}"),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::ExecutionCancelled, "execution cancelled")
    }

    pub fn circuit_open(breaker_name: impl Into<String>) -> Self {
        let breaker_name = breaker_name.into();
        let mut e = Self::new(
            ErrorKind::CircuitOpen,
            format!("circuit breaker '{breaker_name}' is open"),
        );
        e.breaker_name = Some(breaker_name);
        e
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        let mut e = Self::new(
            ErrorKind::Timeout,
            format!("operation timed out after {timeout_ms}ms"),
        );
        e.timeout_ms = Some(timeout_ms);
        e
    }

    pub fn provider_error(provider: impl Into<String>, status_code: Option<u16>, message: impl Into<String>) -> Self {
        let provider = provider.into();
        let kind = match status_code {
            Some(401) | Some(403) => ErrorKind::ProviderAuthFailed,
            Some(429) => ErrorKind::ProviderRateLimit,
            Some(code) if (400..500).contains(&code) => ErrorKind::ProviderInvalidRequest,
            Some(code) if code >= 500 => ErrorKind::ProviderUnavailable,
            _ => ErrorKind::ProviderError,
        };
        let mut e = Self::new(kind, message);
        e.provider = Some(provider.clone());
        e.status_code = status_code;
        e.context = e.context.with_provider(provider);
        e
    }

    /// Whether the retry engine is allowed to retry this error at all.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// A short message safe to surface to end users.
    pub fn user_message(&self) -> String {
        match self.kind {
            ErrorKind::ProviderAuthFailed => "Authentication with the AI provider failed.".into(),
            ErrorKind::ProviderRateLimit => "The AI provider is rate-limiting requests.".into(),
            ErrorKind::ExecutionTimeout | ErrorKind::Timeout => "The operation timed out.".into(),
            ErrorKind::CircuitOpen => "This provider is temporarily unavailable.".into(),
            ErrorKind::ExecutionCancelled => "The execution was cancelled.".into(),
            ErrorKind::ValidationFailed => self.message.clone(),
            _ => "The flow execution failed.".into(),
        }
    }

    /// Remediation hints, when any apply.
    pub fn remediation_suggestions(&self) -> Vec<String> {
        match self.kind {
            ErrorKind::ProviderAuthFailed => vec!["Check the configured API key/connection.".into()],
            ErrorKind::ProviderRateLimit => vec!["Reduce request volume or raise provider quota.".into()],
            ErrorKind::ValidationFailed => self
                .issues
                .iter()
                .map(|i| format!("{}: {}", i.field, i.message))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Classify an arbitrary failure (an HTTP status code plus a message, typically
/// surfaced by a provider SDK) into an [`EngineError`].
pub fn adapt(status_code: Option<u16>, message: impl Into<String>, provider: Option<&str>) -> EngineError {
    let message = message.into();
    if let Some(code) = status_code {
        return EngineError::provider_error(provider.unwrap_or("unknown"), Some(code), message);
    }
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        EngineError::new(ErrorKind::Timeout, message)
    } else if lower.contains("network") || lower.contains("connection") || lower.contains("dns") {
        EngineError::new(ErrorKind::NetworkError, message)
    } else {
        EngineError::new(ErrorKind::Unknown, message)
    }
}

/// A "fatal, raised before the execution ever enters `running`" error — cycles,
/// unknown node kinds, missing executors. These never reach the retry engine.
#[derive(Debug, Error)]
#[error("invalid flow: {0}")]
pub struct FlowCompileError(pub String);

/// Crate-level error composing the engine taxonomy with infrastructural
/// failures.
#[derive(Debug, Error)]
pub enum FlowForgeError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Compile(#[from] FlowCompileError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Store(String),
}

/// Result alias used at API-boundary functions that want attached error context.
pub type FlowForgeResult<T> = error_stack::Result<T, FlowForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_spec() {
        assert!(ErrorKind::NetworkError.is_retryable());
        assert!(ErrorKind::ProviderRateLimit.is_retryable());
        assert!(ErrorKind::ProviderUnavailable.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::ResourceExhausted.is_retryable());
        assert!(!ErrorKind::ValidationFailed.is_retryable());
        assert!(!ErrorKind::ProviderAuthFailed.is_retryable());
        assert!(!ErrorKind::CircuitOpen.is_retryable());
        assert!(!ErrorKind::ExecutionCancelled.is_retryable());
    }

    #[test]
    fn adapt_classifies_status_codes() {
        assert_eq!(
            adapt(Some(401), "nope", Some("openai")).kind,
            ErrorKind::ProviderAuthFailed
        );
        assert_eq!(adapt(Some(429), "slow down", Some("openai")).kind, ErrorKind::ProviderRateLimit);
        assert_eq!(adapt(Some(404), "missing", Some("openai")).kind, ErrorKind::ProviderInvalidRequest);
        assert_eq!(adapt(Some(503), "down", Some("openai")).kind, ErrorKind::ProviderUnavailable);
    }

    #[test]
    fn adapt_classifies_by_message_substring() {
        assert_eq!(adapt(None, "connection reset by peer", None).kind, ErrorKind::NetworkError);
        assert_eq!(adapt(None, "request timed out", None).kind, ErrorKind::Timeout);
    }

    #[test]
    fn circuit_open_carries_breaker_name() {
        let err = EngineError::circuit_open("openai");
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert_eq!(err.breaker_name.as_deref(), Some("openai"));
    }
}
