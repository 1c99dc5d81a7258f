//! Layered engine configuration: defaults -> optional file -> `FLOWFORGE_*` env.

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{FlowForgeError, FlowForgeResult};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub node_default_ms: u64,
    pub sandbox_default_ms: u64,
    pub hybrid_code_ms: u64,
    pub webhook_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            node_default_ms: 30_000,
            sandbox_default_ms: 30_000,
            hybrid_code_ms: 5_000,
            webhook_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub threshold_percent: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self { threshold_percent: 80.0 }
    }
}

/// Top-level engine configuration, covering every retry/breaker/timeout/hybrid knob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub timeouts: TimeoutConfig,
    pub hybrid: HybridConfig,
}

impl EngineConfig {
    /// Load layered configuration: compiled-in defaults, then an optional file
    /// at `path` (TOML/YAML/JSON, detected by extension), then environment
    /// variables prefixed `FLOWFORGE_` (e.g. `FLOWFORGE_RETRY__MAX_ATTEMPTS=5`),
    /// layered in that order.
    pub fn load(path: Option<&str>) -> FlowForgeResult<Self> {
        Self::try_load(path).map_err(|e| error_stack::Report::new(FlowForgeError::Config(e.to_string())))
    }

    fn try_load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let defaults = Self::default();
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&defaults)?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("FLOWFORGE")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
