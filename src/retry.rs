//! Retry engine: backoff-with-jitter, cancellable sleeps, error classification.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use crate::error::{EngineError, ErrorKind};

/// Retry policy: the knobs driving the backoff/jitter/cancellation loop below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// When false, `ProviderAuthFailed` is never retried regardless of attempts left
    /// (always true for the default policy; the function executor's policy and the
    /// AI executor's policy both rely on this staying `false`).
    #[serde(default)]
    pub retry_auth_failures: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            retry_auth_failures: false,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Policy used by the function executor: `maxAttempts=2`.
    pub fn function_default() -> Self {
        Self {
            max_attempts: 2,
            ..Default::default()
        }
    }

    /// Delay before the given zero-indexed retry attempt, excluding jitter:
    /// `min(initial * multiplier^attempt, max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay with +/-25% jitter applied.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let jitter_frac = rand::thread_rng().gen_range(-0.25..=0.25);
        let jittered = (base * (1.0 + jitter_frac)).max(0.0);
        Duration::from_millis(jittered as u64)
    }

    /// Whether this error should be retried under this policy, assuming attempts remain.
    pub fn should_retry(&self, err: &EngineError) -> bool {
        if err.kind == ErrorKind::ProviderAuthFailed && !self.retry_auth_failures {
            return false;
        }
        matches!(
            err.kind,
            ErrorKind::NetworkError
                | ErrorKind::ConnectionFailed
                | ErrorKind::ProviderRateLimit
                | ErrorKind::ProviderUnavailable
                | ErrorKind::Timeout
                | ErrorKind::ExecutionTimeout
                | ErrorKind::ResourceExhausted
        ) || err.is_retryable()
    }
}

/// Execute `f`, retrying on retryable failures per `policy`. `on_retry` is invoked
/// before each sleep; its own failures are swallowed (never abort the retry loop).
///
/// Cancellation via `cancel` during the sleep raises `EXECUTION_CANCELLED` immediately.
pub async fn retry<T, F, Fut, OnRetry>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: OnRetry,
    mut f: F,
) -> Result<T, EngineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
    OnRetry: FnMut(&EngineError, u32, Duration),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_err: Option<EngineError> = None;

    for attempt in 0..max_attempts {
        let span = tracing::info_span!("retry_attempt", attempt, max_attempts);

        if attempt > 0 {
            let delay = policy.delay_with_jitter(attempt - 1);
            let err = last_err.as_ref().expect("retry loop invariant: prior attempt failed");
            on_retry(err, attempt, delay);
            debug!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, "retrying after backoff");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(EngineError::cancelled()),
            }
        }

        if cancel.is_cancelled() {
            return Err(EngineError::cancelled());
        }

        match f(attempt).instrument(span).await {
            Ok(v) => return Ok(v),
            Err(err) => {
                let retryable = attempt + 1 < max_attempts && policy.should_retry(&err);
                if !retryable {
                    if attempt > 0 {
                        warn!(attempt = attempt + 1, %err, "retry attempts exhausted");
                    }
                    return Err(err);
                }
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| EngineError::execution_failed("retry loop completed without result")))
}
