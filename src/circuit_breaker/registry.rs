//! Process-wide registry of breakers, one per key (typically a provider name).

use std::sync::Arc;

use dashmap::DashMap;

use super::config::CircuitBreakerConfig;
use super::state::CircuitBreaker;

/// A process-wide, get-or-insert registry of circuit breakers keyed by name.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            default_config,
        }
    }

    /// Fetch the breaker for `key`, creating it with the registry's default
    /// config on first use.
    pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return existing.clone();
        }
        let created = Arc::new(CircuitBreaker::new(key, self.default_config.clone()));
        self.breakers.insert(key.to_string(), created.clone());
        created
    }

    /// Fetch or create a breaker for `key` with an explicit per-key override config.
    pub fn get_or_create_with(&self, key: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return existing.clone();
        }
        let created = Arc::new(CircuitBreaker::new(key, config));
        self.breakers.insert(key.to_string(), created.clone());
        created
    }

    /// Reset every known breaker to CLOSED. Exposed for tests.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
