//! Circuit breaker state machine: CLOSED -> OPEN -> HALF_OPEN -> {CLOSED|OPEN}.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::config::CircuitBreakerConfig;
use crate::error::EngineError;

/// The three legal breaker states. No other transitions exist than the ones
/// documented on [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Closed => write!(f, "CLOSED"),
            State::Open => write!(f, "OPEN"),
            State::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Introspectable breaker statistics.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: State,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub window_requests: u64,
}

/// A single named breaker. Internally mutex/atomic protected so it can live
/// behind a shared `Arc` in the process-wide [`super::registry::CircuitBreakerRegistry`].
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<State>,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    half_open_inflight: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    window_start: RwLock<Instant>,
    window_failures: AtomicU64,
    window_requests: AtomicU64,
    last_failure_logged_at: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(State::Closed),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            half_open_inflight: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            window_start: RwLock::new(Instant::now()),
            window_failures: AtomicU64::new(0),
            window_requests: AtomicU64::new(0),
            last_failure_logged_at: RwLock::new(None),
        }
    }

    pub fn with_default(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying the OPEN -> HALF_OPEN auto-transition if
    /// `reset_timeout` has elapsed.
    pub fn state(&self) -> State {
        self.maybe_transition_to_half_open();
        *self.state.read()
    }

    fn maybe_transition_to_half_open(&self) {
        if *self.state.read() != State::Open {
            return;
        }
        let elapsed = self.opened_at.read().map(|at| at.elapsed());
        if let Some(elapsed) = elapsed {
            if elapsed >= self.config.reset_timeout {
                let mut state = self.state.write();
                if *state == State::Open {
                    *state = State::HalfOpen;
                    self.half_open_inflight.store(0, Ordering::SeqCst);
                    self.consecutive_successes.store(0, Ordering::SeqCst);
                    info!(breaker = %self.name, "circuit breaker transitioned to HALF_OPEN");
                }
            }
        }
    }

    /// Whether a call may proceed right now. `false` iff OPEN, or HALF_OPEN at
    /// the concurrent-probe cap.
    pub fn can_execute(&self) -> bool {
        match self.state() {
            State::Closed => true,
            State::Open => false,
            State::HalfOpen => {
                self.half_open_inflight.load(Ordering::SeqCst) < self.config.half_open_max_concurrent
            }
        }
    }

    fn reset_window_if_needed(&self) {
        let expired = self.window_start.read().elapsed() >= self.config.failure_window;
        if expired {
            let mut start = self.window_start.write();
            if start.elapsed() >= self.config.failure_window {
                *start = Instant::now();
                self.window_failures.store(0, Ordering::SeqCst);
                self.window_requests.store(0, Ordering::SeqCst);
            }
        }
    }

    pub fn record_success(&self) {
        self.reset_window_if_needed();
        self.window_requests.fetch_add(1, Ordering::SeqCst);
        match self.state() {
            State::HalfOpen => {
                self.half_open_inflight.fetch_sub(1, Ordering::SeqCst);
                let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to_closed();
                }
            }
            State::Closed => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            State::Open => {}
        }
    }

    pub fn record_failure(&self, err: &EngineError) {
        self.reset_window_if_needed();
        self.window_requests.fetch_add(1, Ordering::SeqCst);
        self.window_failures.fetch_add(1, Ordering::SeqCst);
        self.throttled_log_failure(err);

        match self.state() {
            State::HalfOpen => {
                self.half_open_inflight.fetch_sub(1, Ordering::SeqCst);
                self.transition_to_open();
            }
            State::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to_open();
                }
            }
            State::Open => {}
        }
    }

    /// A timeout counts as a failure (`count_timeouts_as_failures=true` by default).
    pub fn record_timeout(&self, err: &EngineError) {
        self.record_failure(err);
    }

    fn throttled_log_failure(&self, err: &EngineError) {
        let mut last = self.last_failure_logged_at.write();
        let should_log = last.map(|at| at.elapsed() >= Duration::from_secs(1)).unwrap_or(true);
        if should_log {
            warn!(breaker = %self.name, %err, "circuit breaker recorded failure");
            *last = Some(Instant::now());
        }
    }

    fn transition_to_open(&self) {
        let mut state = self.state.write();
        if *state != State::Open {
            *state = State::Open;
            *self.opened_at.write() = Some(Instant::now());
            self.consecutive_failures.store(0, Ordering::SeqCst);
            self.consecutive_successes.store(0, Ordering::SeqCst);
            warn!(breaker = %self.name, "circuit breaker OPEN");
        }
    }

    fn transition_to_closed(&self) {
        let mut state = self.state.write();
        *state = State::Closed;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.consecutive_successes.store(0, Ordering::SeqCst);
        *self.opened_at.write() = None;
        debug!(breaker = %self.name, "circuit breaker CLOSED");
    }

    /// Reserve a half-open probe slot. Call sites must call this only after
    /// `can_execute()` returned true while in HALF_OPEN.
    pub fn begin_half_open_probe(&self) {
        if self.state() == State::HalfOpen {
            self.half_open_inflight.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            name: self.name.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            consecutive_successes: self.consecutive_successes.load(Ordering::SeqCst),
            window_requests: self.window_requests.load(Ordering::SeqCst),
        }
    }

    /// Force the breaker back to CLOSED with all counters reset. Exposed for tests.
    pub fn reset(&self) {
        self.transition_to_closed();
        self.window_failures.store(0, Ordering::SeqCst);
        self.window_requests.store(0, Ordering::SeqCst);
        *self.window_start.write() = Instant::now();
    }

    /// Run `f` through the breaker: reject with `CIRCUIT_OPEN` if `can_execute()`
    /// is false, otherwise run it and record the outcome.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, EngineError>>,
    {
        if !self.can_execute() {
            return Err(EngineError::circuit_open(self.name.clone()));
        }
        if self.state() == State::HalfOpen {
            self.begin_half_open_probe();
        }
        match f().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(err) => {
                if err.kind == crate::error::ErrorKind::Timeout || err.kind == crate::error::ErrorKind::ExecutionTimeout {
                    self.record_timeout(&err);
                } else {
                    self.record_failure(&err);
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn failure() -> EngineError {
        EngineError::new(ErrorKind::ProviderUnavailable, "down")
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("p", CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        assert_eq!(cb.state(), State::Closed);
        cb.record_failure(&failure());
        cb.record_failure(&failure());
        assert_eq!(cb.state(), State::Closed);
        cb.record_failure(&failure());
        assert_eq!(cb.state(), State::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn half_open_success_threshold_closes() {
        let mut config = CircuitBreakerConfig::default();
        config.failure_threshold = 1;
        config.reset_timeout = Duration::from_millis(0);
        config.success_threshold = 2;
        let cb = CircuitBreaker::new("p", config);
        cb.record_failure(&failure());
        assert_eq!(cb.state(), State::HalfOpen);
        cb.begin_half_open_probe();
        cb.record_success();
        assert_eq!(cb.state(), State::HalfOpen);
        cb.begin_half_open_probe();
        cb.record_success();
        assert_eq!(cb.state(), State::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut config = CircuitBreakerConfig::default();
        config.failure_threshold = 1;
        config.reset_timeout = Duration::from_millis(0);
        let cb = CircuitBreaker::new("p", config);
        cb.record_failure(&failure());
        assert_eq!(cb.state(), State::HalfOpen);
        cb.begin_half_open_probe();
        cb.record_failure(&failure());
        assert_eq!(cb.state(), State::Open);
    }

    #[test]
    fn half_open_respects_max_concurrent() {
        let mut config = CircuitBreakerConfig::default();
        config.failure_threshold = 1;
        config.reset_timeout = Duration::from_millis(0);
        config.half_open_max_concurrent = 1;
        let cb = CircuitBreaker::new("p", config);
        cb.record_failure(&failure());
        assert!(cb.can_execute());
        cb.begin_half_open_probe();
        assert!(!cb.can_execute());
    }

    #[tokio::test]
    async fn execute_rejects_when_open() {
        let mut config = CircuitBreakerConfig::default();
        config.failure_threshold = 1;
        let cb = CircuitBreaker::new("p", config);
        let _ = cb.execute(|| async { Err::<(), _>(failure()) }).await;
        assert_eq!(cb.state(), State::Open);
        let res = cb.execute(|| async { Ok::<_, EngineError>(1) }).await;
        assert_eq!(res.unwrap_err().kind, ErrorKind::CircuitOpen);
    }
}
