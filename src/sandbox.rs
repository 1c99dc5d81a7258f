//! Sandbox runner: bounded-memory, time-capped, capability-free code execution.
//!
//! The contract is the trait, not this implementation — callers depend only on
//! [`SandboxRunner`]. [`RhaiSandbox`] is the reference implementation, embedding
//! the `rhai` scripting engine with no file/process/network/env API registered
//! and hard operation/size/call-depth limits in place of OS-level isolation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, ErrorKind};

/// Resource limits enforced on every sandbox invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    pub timeout_ms: u64,
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_array_size: usize,
    pub max_string_size: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_operations: 500_000,
            max_call_levels: 32,
            max_array_size: 10_000,
            max_string_size: 1_000_000,
        }
    }
}

impl SandboxLimits {
    /// The tighter cap used on the hybrid-code path.
    pub fn hybrid_code() -> Self {
        Self {
            timeout_ms: 5_000,
            ..Default::default()
        }
    }
}

/// Outcome of one sandbox invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxOutput {
    pub result: Value,
    pub duration_ms: u64,
    pub operations_count: u64,
}

/// The engine's dependency on a sandboxed code executor. Run a code string
/// against exactly one input value and return its result.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(&self, code: &str, input: Value, limits: &SandboxLimits) -> Result<SandboxOutput, EngineError>;
}

/// `rhai`-backed sandbox. A fresh [`Engine`] is configured per call so that
/// per-call limits never leak between invocations.
#[derive(Default, Clone)]
pub struct RhaiSandbox;

impl RhaiSandbox {
    pub fn new() -> Self {
        Self
    }

    fn build_engine(limits: &SandboxLimits) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(limits.max_operations);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_array_size(limits.max_array_size);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_expr_depths(64, 64);
        engine.set_allow_looping(false);
        // No file, process, network, or module-resolution API is ever registered —
        // this is the sandbox's enforcement of "capability-free" in lieu of an OS
        // isolate. `Engine::new_raw` would drop even the standard library; we keep
        // the standard (safe, pure-data) library but never call `register_fn` with
        // anything host-capable.
        engine
    }
}

#[async_trait]
impl SandboxRunner for RhaiSandbox {
    async fn run(&self, code: &str, input: Value, limits: &SandboxLimits) -> Result<SandboxOutput, EngineError> {
        let code = code.to_string();
        let limits = limits.clone();
        let timeout = Duration::from_millis(limits.timeout_ms);

        let handle = tokio::task::spawn_blocking(move || execute_blocking(&code, input, &limits));

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(EngineError::execution_failed(format!("sandbox task panicked: {join_err}"))),
            Err(_elapsed) => Err(EngineError::new(
                ErrorKind::Timeout,
                format!("sandbox execution exceeded {}ms", timeout.as_millis()),
            )),
        }
    }
}

fn execute_blocking(code: &str, input: Value, limits: &SandboxLimits) -> Result<SandboxOutput, EngineError> {
    let started = Instant::now();
    let engine = RhaiSandbox::build_engine(limits);

    let ast = engine.compile(code).map_err(|err| {
        EngineError::new(ErrorKind::ValidationFailed, format!("sandbox code failed to compile: {err}"))
    })?;

    let mut scope = Scope::new();
    scope.push("input", json_to_dynamic(&input));

    let result: Result<Dynamic, _> = engine.eval_ast_with_scope(&mut scope, &ast);

    match result {
        Ok(value) => Ok(SandboxOutput {
            result: dynamic_to_json(&value),
            duration_ms: started.elapsed().as_millis() as u64,
            operations_count: 0,
        }),
        Err(err) => Err(classify_rhai_error(*err)),
    }
}

fn classify_rhai_error(err: EvalAltResult) -> EngineError {
    match err {
        EvalAltResult::ErrorParsing(..) => {
            EngineError::new(ErrorKind::ValidationFailed, format!("sandbox syntax error: {err}"))
        }
        EvalAltResult::ErrorTooManyOperations(..) => {
            EngineError::new(ErrorKind::ResourceExhausted, format!("sandbox exceeded operation limit: {err}"))
        }
        EvalAltResult::ErrorDataTooLarge(..) | EvalAltResult::ErrorArrayBounds(..) => {
            EngineError::new(ErrorKind::ResourceExhausted, format!("sandbox exceeded resource limit: {err}"))
        }
        EvalAltResult::ErrorStackOverflow(..) | EvalAltResult::ErrorTooManyModules(..) => {
            EngineError::new(ErrorKind::ResourceExhausted, format!("sandbox exceeded call-depth limit: {err}"))
        }
        other => EngineError::new(ErrorKind::ExecutionFailed, format!("sandbox runtime error: {other}")),
    }
}

/// JSON -> Rhai value marshalling.
pub fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else {
                Dynamic::from(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            let arr: rhai::Array = items.iter().map(json_to_dynamic).collect();
            Dynamic::from(arr)
        }
        Value::Object(map) => {
            let mut rhai_map = rhai::Map::new();
            for (k, v) in map {
                rhai_map.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from_map(rhai_map)
        }
    }
}

/// Rhai value -> JSON marshalling.
pub fn dynamic_to_json(value: &Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return Value::Bool(b);
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return Value::Number(i.into());
    }
    if let Some(f) = value.clone().try_cast::<f64>() {
        return serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null);
    }
    if let Some(s) = value.clone().try_cast::<rhai::ImmutableString>() {
        return Value::String(s.to_string());
    }
    if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
        return Value::Array(arr.iter().map(dynamic_to_json).collect());
    }
    if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        let obj = map.iter().map(|(k, v)| (k.to_string(), dynamic_to_json(v))).collect();
        return Value::Object(obj);
    }
    Value::String(value.to_string())
}
