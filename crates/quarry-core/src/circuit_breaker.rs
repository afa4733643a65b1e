//! Circuit breaker for provider and internal-service calls.
//!
//! Stops hammering a dependency that is already failing, then probes it
//! with a limited number of trial calls once a cool-down has passed.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED --[failure_threshold consecutive failures]--> OPEN --[recovery_timeout]--> HALF_OPEN
//!   ^                                                    ^                            |
//!   |                                                    +--------[failure]-----------+
//!   +------------------------[success_threshold successes]----------------------------+
//! ```
//!
//! Only errors for which [`AppError::should_trip_circuit`] holds count as
//! failures; a bad query or a missing listing says nothing about the health
//! of the dependency.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected immediately.
    Open,
    /// A limited number of trial calls are let through.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Successful trial calls in half-open state needed to close the circuit.
    pub success_threshold: u32,

    /// Trial calls allowed in flight at once while half-open.
    pub half_open_max_calls: u32,

    /// Time to wait before transitioning from Open to Half-Open.
    pub recovery_timeout: Duration,

    /// When the opening failure is a rate limit, multiply the cool-down by this factor.
    pub rate_limit_backoff_multiplier: f32,

    /// Maximum cool-down after rate limit backoffs.
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            half_open_max_calls: 1,
            recovery_timeout: Duration::from_secs(30),
            rate_limit_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    last_error_message: Option<String>,
    current_recovery_timeout: Duration,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_in_flight: 0,
            opened_at: None,
            last_error_message: None,
            current_recovery_timeout: config.recovery_timeout,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    fn time_until_half_open(&self) -> Duration {
        self.opened_at
            .map(|t| self.current_recovery_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(self.current_recovery_timeout)
    }
}

/// Snapshot of a breaker for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub last_error: Option<String>,
    #[serde(serialize_with = "serialize_opt_secs")]
    pub time_until_half_open: Option<Duration>,
}

fn serialize_opt_secs<S: serde::Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_some(&d.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

/// Error type for circuit breaker operations.
#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    /// The call was rejected without reaching the dependency.
    #[error("Circuit breaker '{name}' is open. Retry after {} seconds.", .retry_after.as_secs())]
    Open { name: String, retry_after: Duration },
    /// The call ran and failed.
    #[error(transparent)]
    Inner(AppError),
}

impl From<CircuitBreakerError> for AppError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::Open { name, retry_after } => {
                AppError::CircuitOpen { name, retry_after }
            }
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

/// Releases a half-open trial slot when the call ends, including when the
/// caller's future is dropped mid-flight.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    active: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.active {
            let mut inner = self.breaker.lock_inner();
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// Thread-safe circuit breaker, cheap to clone and share.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open =
            (inner.state == CircuitState::Open).then(|| inner.time_until_half_open());

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            last_error: inner.last_error_message.clone(),
            time_until_half_open,
        }
    }

    /// Admit a call or reject it. Returns whether the call holds a half-open
    /// trial slot.
    fn admit(&self) -> Result<bool, CircuitBreakerError> {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen if inner.half_open_in_flight < self.config.half_open_max_calls => {
                inner.half_open_in_flight += 1;
                Ok(true)
            }
            CircuitState::HalfOpen => {
                inner.total_rejections += 1;
                // A trial is already running; its outcome decides the next state.
                Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_after: Duration::ZERO,
                })
            }
            CircuitState::Open => {
                inner.total_rejections += 1;
                Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_after: inner.time_until_half_open(),
                })
            }
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open: returns `CircuitBreakerError::Open` immediately
    /// - HalfOpen: executes up to `half_open_max_calls` trial operations,
    ///   transitions based on their result
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let trial = self.admit()?;
        let _slot = TrialSlot {
            breaker: self,
            active: trial,
        };

        let result = operation().await;

        match &result {
            Ok(_) => self.on_success(trial),
            Err(e) if e.should_trip_circuit() => self.on_failure(e, trial),
            Err(_) => {}
        }

        result.map_err(CircuitBreakerError::Inner)
    }

    /// Record a success observed outside [`call`](Self::call). In half-open
    /// it counts as a trial.
    pub fn record_success(&self) {
        self.on_success(true);
    }

    /// Record a failure observed outside [`call`](Self::call). In half-open
    /// it counts as a trial.
    pub fn record_failure(&self, error: &AppError) {
        self.on_failure(error, true);
    }

    /// Only calls that held a trial slot move a half-open breaker; a call
    /// admitted while closed that finishes late leaves it alone.
    fn on_success(&self, trial: bool) {
        let mut inner = self.lock_inner();
        inner.total_successes += 1;

        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(
                        circuit = %self.name,
                        "Circuit breaker closing after {} successful probes",
                        inner.success_count
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    inner.last_error_message = None;
                    inner.current_recovery_timeout = self.config.recovery_timeout;
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, error: &AppError, trial: bool) {
        let mut inner = self.lock_inner();
        inner.total_failures += 1;
        inner.last_error_message = Some(error.to_string());

        let is_rate_limit = matches!(error, AppError::RateLimitExceeded { .. })
            || matches!(
                error,
                AppError::ProviderError {
                    status_code: Some(429),
                    ..
                }
            );

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit breaker opening after {} consecutive failures",
                        inner.failure_count
                    );
                    self.open(&mut inner, is_rate_limit);
                }
            }
            CircuitState::HalfOpen if trial => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker probe failed, returning to open state"
                );
                inner.success_count = 0;
                self.open(&mut inner, is_rate_limit);
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut CircuitBreakerInner, is_rate_limit: bool) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());

        if is_rate_limit {
            inner.current_recovery_timeout = std::cmp::min(
                Duration::from_secs_f32(
                    inner.current_recovery_timeout.as_secs_f32()
                        * self.config.rate_limit_backoff_multiplier,
                ),
                self.config.max_recovery_timeout,
            );
            tracing::info!(
                circuit = %self.name,
                recovery_timeout_secs = inner.current_recovery_timeout.as_secs(),
                "Extended recovery timeout due to rate limit"
            );
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
        inner.last_error_message = None;
        inner.current_recovery_timeout = self.config.recovery_timeout;
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= inner.current_recovery_timeout
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.half_open_in_flight = 0;
        }
    }
}
