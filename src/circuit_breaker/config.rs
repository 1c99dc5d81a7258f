use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Circuit breaker configuration and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
    pub half_open_max_concurrent: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            success_threshold: 3,
            half_open_max_concurrent: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn strict() -> Self {
        Self {
            failure_threshold: 2,
            failure_window: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(60),
            success_threshold: 5,
            half_open_max_concurrent: 1,
        }
    }

    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            failure_window: Duration::from_secs(120),
            reset_timeout: Duration::from_secs(15),
            success_threshold: 2,
            half_open_max_concurrent: 5,
        }
    }

    pub fn disabled() -> Self {
        Self {
            failure_threshold: u32::MAX,
            ..Default::default()
        }
    }
}
