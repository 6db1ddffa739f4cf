//! Bounded retries with exponential backoff, a per-operation circuit breaker,
//! timeout enforcement and fallbacks.
//!
//! Breaker lifecycle for one operation id:
//!
//! ```text
//! closed --(threshold consecutive failures)--> open
//! open   --(timeout elapsed, checked on next call)--> half-open
//! half-open --success--> closed
//! half-open --failure--> open (timer restarts)
//! ```
//!
//! Any success, in any state, resets the failure count and closes the breaker.

use crate::clock::SharedClock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_open_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Point-in-time copy of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub failures: u32,
    pub last_failure_ms: i64,
    pub state: CircuitState,
    pub threshold: u32,
    pub timeout_ms: u64,
}

/// Why a guarded operation did not produce a value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryError<E> {
    #[error("circuit breaker open for {operation_id}")]
    CircuitOpen { operation_id: String },

    #[error("operation timeout after {}ms", timeout.as_millis())]
    Timeout { operation_id: String, timeout: Duration },

    #[error("{operation_id} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        operation_id: String,
        attempts: u32,
        last_error: E,
    },
}

impl<E> RetryError<E> {
    pub fn operation_id(&self) -> &str {
        match self {
            Self::CircuitOpen { operation_id }
            | Self::Timeout { operation_id, .. }
            | Self::Exhausted { operation_id, .. } => operation_id,
        }
    }
}

/// Outcome of a single attempt inside the retry loop.
enum AttemptError<E> {
    TimedOut(Duration),
    Failed(E),
}

/// Backoff before the retry following `attempt` (0-based), before jitter.
pub fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let raw = config.base_delay_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    Duration::from_millis(raw.min(config.max_delay_ms as f64).max(0.0) as u64)
}

/// Apply up to +/-10% jitter. `sample` is in `[-1.0, 1.0]`.
pub fn apply_jitter(delay: Duration, sample: f64) -> Duration {
    let ms = delay.as_millis() as f64;
    let jittered = ms + sample.clamp(-1.0, 1.0) * ms * 0.1;
    Duration::from_millis(jittered.max(0.0) as u64)
}

#[derive(Debug, Clone)]
struct BreakerState {
    failures: u32,
    last_failure_ms: i64,
    state: CircuitState,
    threshold: u32,
    timeout_ms: u64,
}

/// Wraps fallible async operations with retries and circuit breaking.
pub struct RetryHandler {
    breakers: Mutex<HashMap<String, BreakerState>>,
    clock: SharedClock,
    defaults: RetryConfig,
    breaker_config: BreakerConfig,
}

impl RetryHandler {
    pub fn new(clock: SharedClock, defaults: RetryConfig, breaker_config: BreakerConfig) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            clock,
            defaults,
            breaker_config,
        }
    }

    pub fn defaults(&self) -> &RetryConfig {
        &self.defaults
    }

    fn breakers(&self) -> MutexGuard<'_, HashMap<String, BreakerState>> {
        match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether a call may go ahead. Moves an expired open breaker to half-open.
    fn can_execute(&self, operation_id: &str) -> bool {
        let now = self.clock.now_ms();
        let mut breakers = self.breakers();
        let Some(breaker) = breakers.get_mut(operation_id) else {
            return true;
        };

        match breaker.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if now - breaker.last_failure_ms > breaker.timeout_ms as i64 {
                    breaker.state = CircuitState::HalfOpen;
                    tracing::info!(operation_id, "circuit breaker half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self, operation_id: &str) {
        if let Some(breaker) = self.breakers().get_mut(operation_id) {
            if breaker.state != CircuitState::Closed {
                tracing::info!(operation_id, "circuit breaker closed");
            }
            breaker.failures = 0;
            breaker.state = CircuitState::Closed;
        }
    }

    fn on_failure(&self, operation_id: &str) {
        let now = self.clock.now_ms();
        let mut breakers = self.breakers();
        let breaker = breakers
            .entry(operation_id.to_string())
            .or_insert_with(|| BreakerState {
                failures: 0,
                last_failure_ms: 0,
                state: CircuitState::Closed,
                threshold: self.breaker_config.failure_threshold,
                timeout_ms: self.breaker_config.open_timeout_ms,
            });

        breaker.failures += 1;
        breaker.last_failure_ms = now;

        let reopen = breaker.state == CircuitState::HalfOpen;
        if (reopen || breaker.failures >= breaker.threshold) && breaker.state != CircuitState::Open
        {
            breaker.state = CircuitState::Open;
            tracing::warn!(
                operation_id,
                failures = breaker.failures,
                "circuit breaker opened"
            );
        }
    }

    fn retry_delay(&self, attempt: u32, config: &RetryConfig) -> Duration {
        let delay = backoff_delay(attempt, config);
        if config.jitter {
            apply_jitter(delay, rand::thread_rng().gen_range(-1.0..=1.0))
        } else {
            delay
        }
    }

    async fn run<T, E, F, Fut>(
        &self,
        mut operation: F,
        operation_id: &str,
        config: &RetryConfig,
        timeout: Option<Duration>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if !self.can_execute(operation_id) {
            return Err(RetryError::CircuitOpen {
                operation_id: operation_id.to_string(),
            });
        }

        let mut attempt = 0;
        loop {
            let outcome = match timeout {
                Some(limit) => {
                    let sleep = self.clock.sleep(limit);
                    tokio::select! {
                        biased;
                        result = operation() => result.map_err(AttemptError::Failed),
                        _ = sleep => Err(AttemptError::TimedOut(limit)),
                    }
                }
                None => operation().await.map_err(AttemptError::Failed),
            };

            let err = match outcome {
                Ok(value) => {
                    self.on_success(operation_id);
                    return Ok(value);
                }
                Err(err) => err,
            };

            self.on_failure(operation_id);
            match &err {
                AttemptError::TimedOut(limit) => tracing::warn!(
                    operation_id,
                    attempt,
                    timeout_ms = limit.as_millis() as u64,
                    "attempt timed out"
                ),
                AttemptError::Failed(e) => {
                    tracing::warn!(operation_id, attempt, error = %e, "attempt failed")
                }
            }

            if attempt >= config.max_retries {
                let attempts = attempt + 1;
                tracing::error!(operation_id, attempts, "all retry attempts failed");
                return Err(match err {
                    AttemptError::TimedOut(limit) => RetryError::Timeout {
                        operation_id: operation_id.to_string(),
                        timeout: limit,
                    },
                    AttemptError::Failed(last_error) => RetryError::Exhausted {
                        operation_id: operation_id.to_string(),
                        attempts,
                        last_error,
                    },
                });
            }

            let delay = self.retry_delay(attempt, config);
            self.clock.sleep(delay).await;
            attempt += 1;
        }
    }

    /// Run `operation` up to `max_retries + 1` times, backing off between
    /// failures. Fails fast with `CircuitOpen` while the breaker is open.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        operation: F,
        operation_id: &str,
        config: Option<&RetryConfig>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let config = config.unwrap_or(&self.defaults).clone();
        self.run(operation, operation_id, &config, None).await
    }

    /// Like `execute_with_retry` with default settings, but each attempt races
    /// a timer. A timeout is a retryable failure; the abandoned future is
    /// dropped, not cancelled upstream.
    pub async fn execute_with_timeout<T, E, F, Fut>(
        &self,
        operation: F,
        timeout: Duration,
        operation_id: &str,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let config = self.defaults.clone();
        self.run(operation, operation_id, &config, Some(timeout))
            .await
    }

    /// Run `primary` under retry; if it fails for any reason run `fallback`
    /// once. A fallback failure is returned as-is.
    pub async fn execute_with_fallback<T, E, P, PFut, B, BFut>(
        &self,
        primary: P,
        fallback: B,
        operation_id: &str,
    ) -> Result<T, E>
    where
        P: FnMut() -> PFut,
        PFut: Future<Output = Result<T, E>>,
        B: FnOnce() -> BFut,
        BFut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        match self.execute_with_retry(primary, operation_id, None).await {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!(operation_id, error = %e, "primary operation failed, trying fallback");
                fallback().await.inspect_err(|fallback_err| {
                    tracing::error!(
                        operation_id,
                        error = %fallback_err,
                        "primary and fallback both failed"
                    );
                })
            }
        }
    }

    pub fn breaker_stats(&self) -> HashMap<String, BreakerSnapshot> {
        self.breakers()
            .iter()
            .map(|(id, b)| {
                (
                    id.clone(),
                    BreakerSnapshot {
                        failures: b.failures,
                        last_failure_ms: b.last_failure_ms,
                        state: b.state,
                        threshold: b.threshold,
                        timeout_ms: b.timeout_ms,
                    },
                )
            })
            .collect()
    }

    /// Forget the breaker for `operation_id`. Returns whether one existed.
    pub fn reset_breaker(&self, operation_id: &str) -> bool {
        self.breakers().remove(operation_id).is_some()
    }

    pub fn reset_all_breakers(&self) {
        self.breakers().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn handler() -> (RetryHandler, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let handler = RetryHandler::new(
            Arc::new(clock.clone()),
            RetryConfig {
                jitter: false,
                ..RetryConfig::default()
            },
            BreakerConfig::default(),
        );
        (handler, clock)
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let config = RetryConfig::default();
        assert_eq!(backoff_delay(0, &config), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1, &config), Duration::from_millis(2000));
        assert_eq!(backoff_delay(3, &config), Duration::from_millis(8000));
        assert_eq!(backoff_delay(4, &config), Duration::from_millis(10_000));
        assert_eq!(backoff_delay(20, &config), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let delay = Duration::from_millis(1000);
        assert_eq!(apply_jitter(delay, 1.0), Duration::from_millis(1100));
        assert_eq!(apply_jitter(delay, -1.0), Duration::from_millis(900));
        assert_eq!(apply_jitter(delay, 0.0), delay);
        assert_eq!(apply_jitter(delay, 5.0), Duration::from_millis(1100));
    }

    #[tokio::test]
    async fn test_fails_twice_then_succeeds_with_two_delays() {
        let (handler, clock) = handler();
        let calls = AtomicU32::new(0);

        let result: Result<&str, RetryError<String>> = handler
            .execute_with_retry(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(format!("boom {n}"))
                        } else {
                            Ok("brand")
                        }
                    }
                },
                "generate",
                None,
            )
            .await;

        assert_eq!(result.unwrap(), "brand");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
        assert_eq!(handler.breaker_stats()["generate"].failures, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let (handler, clock) = handler();
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 2,
            jitter: false,
            ..RetryConfig::default()
        };

        let result: Result<(), _> = handler
            .execute_with_retry(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err::<(), _>(format!("failure {n}")) }
                },
                "op",
                Some(&config),
            )
            .await;

        match result {
            Err(RetryError::Exhausted {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "failure 2");
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_retries_returns_first_error_without_sleeping() {
        let (handler, clock) = handler();
        let config = RetryConfig {
            max_retries: 0,
            jitter: false,
            ..RetryConfig::default()
        };

        let result: Result<(), _> = handler
            .execute_with_retry(|| async { Err::<(), _>("only try") }, "op", Some(&config))
            .await;

        match result {
            Err(RetryError::Exhausted {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 1);
                assert_eq!(last_error, "only try");
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
        assert!(clock.sleeps().is_empty());
        assert_eq!(handler.breaker_stats()["op"].failures, 1);
    }

    #[tokio::test]
    async fn test_five_failures_open_the_breaker() {
        let (handler, clock) = handler();
        let config = RetryConfig {
            max_retries: 4,
            jitter: false,
            ..RetryConfig::default()
        };

        let _ = handler
            .execute_with_retry(|| async { Err::<(), _>("down") }, "X", Some(&config))
            .await;
        assert_eq!(handler.breaker_stats()["X"].state, CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = handler
            .execute_with_retry(
                || {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, String>(()) }
                },
                "X",
                None,
            )
            .await;
        assert!(matches!(result, Err(RetryError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        // Other operations are unaffected
        let other = handler
            .execute_with_retry(|| async { Ok::<_, String>(1) }, "Y", None)
            .await;
        assert_eq!(other.unwrap(), 1);

        // Once the open timeout elapses the next call probes and closes it
        clock.advance(Duration::from_millis(60_001));
        let probe = handler
            .execute_with_retry(|| async { Ok::<_, String>(2) }, "X", None)
            .await;
        assert_eq!(probe.unwrap(), 2);
        let snapshot = &handler.breaker_stats()["X"];
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failures, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let (handler, clock) = handler();
        let config = RetryConfig {
            max_retries: 0,
            jitter: false,
            ..RetryConfig::default()
        };

        for _ in 0..5 {
            let _ = handler
                .execute_with_retry(|| async { Err::<(), _>("down") }, "X", Some(&config))
                .await;
        }
        assert_eq!(handler.breaker_stats()["X"].state, CircuitState::Open);

        clock.advance(Duration::from_millis(60_001));
        let probe = handler
            .execute_with_retry(|| async { Err::<(), _>("still down") }, "X", Some(&config))
            .await;
        assert!(matches!(probe, Err(RetryError::Exhausted { .. })));
        assert_eq!(handler.breaker_stats()["X"].state, CircuitState::Open);

        let blocked = handler
            .execute_with_retry(|| async { Ok::<_, &str>(()) }, "X", Some(&config))
            .await;
        assert!(matches!(blocked, Err(RetryError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_and_retried() {
        let (handler, _clock) = handler();
        let calls = AtomicU32::new(0);

        let result: Result<(), RetryError<String>> = handler
            .execute_with_timeout(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::future::pending::<Result<(), String>>()
                },
                Duration::from_secs(30),
                "slow",
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "operation timeout after 30000ms");
        assert!(matches!(err, RetryError::Timeout { .. }));
        assert_eq!(err.operation_id(), "slow");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_timeout_does_not_fire_for_ready_operation() {
        let (handler, clock) = handler();
        let result = handler
            .execute_with_timeout(|| async { Ok::<_, String>("fast") }, Duration::from_secs(1), "op")
            .await;
        assert_eq!(result.unwrap(), "fast");
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_runs_after_exhaustion() {
        let (handler, _clock) = handler();
        let result = handler
            .execute_with_fallback(
                || async { Err::<&str, String>("primary down".to_string()) },
                || async { Ok("fallback") },
                "op",
            )
            .await;
        assert_eq!(result.unwrap(), "fallback");
    }

    #[tokio::test]
    async fn test_fallback_error_propagates() {
        let (handler, _clock) = handler();
        let result = handler
            .execute_with_fallback(
                || async { Err::<(), String>("primary down".to_string()) },
                || async { Err("fallback down".to_string()) },
                "op",
            )
            .await;
        assert_eq!(result.unwrap_err(), "fallback down");
    }

    #[tokio::test]
    async fn test_reset_breaker() {
        let (handler, _clock) = handler();
        let config = RetryConfig {
            max_retries: 0,
            jitter: false,
            ..RetryConfig::default()
        };
        let _ = handler
            .execute_with_retry(|| async { Err::<(), _>("x") }, "op", Some(&config))
            .await;

        assert!(handler.reset_breaker("op"));
        assert!(!handler.reset_breaker("op"));
        assert!(handler.breaker_stats().is_empty());
    }
}
