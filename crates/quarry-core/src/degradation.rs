//! Graceful degradation: a primary operation with ordered, flag-gated fallbacks.
//!
//! ```text
//! primary --fail--> fallback(p=1) --fail--> fallback(p=2) --fail--> AllFallbacksFailed
//!    |                   |                       |
//!   ok                  ok                      ok    (first success wins)
//! ```
//!
//! A fallback whose feature flag is disabled is skipped without being run
//! and does not count as an attempt.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::AppError;

pub const DISABLED_FALLBACKS_ENV: &str = "QUARRY_DISABLED_FALLBACKS";

/// Runtime switches consulted before each fallback.
pub trait FeatureFlags: Send + Sync {
    fn is_enabled(&self, flag: &str) -> bool;
}

/// Every flag is enabled unless explicitly disabled.
#[derive(Debug, Clone, Default)]
pub struct StaticFeatureFlags {
    disabled: HashSet<String>,
}

impl StaticFeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_disabled<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            disabled: flags.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a comma-separated list of disabled flags.
    pub fn parse(list: &str) -> Self {
        Self::with_disabled(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        )
    }

    /// Read disabled flags from `QUARRY_DISABLED_FALLBACKS`.
    pub fn from_env() -> Self {
        std::env::var(DISABLED_FALLBACKS_ENV)
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }

    pub fn disable(&mut self, flag: impl Into<String>) {
        self.disabled.insert(flag.into());
    }

    pub fn disabled(&self) -> impl Iterator<Item = &str> {
        self.disabled.iter().map(String::as_str)
    }
}

impl FeatureFlags for StaticFeatureFlags {
    fn is_enabled(&self, flag: &str) -> bool {
        !self.disabled.contains(flag)
    }
}

pub type StrategyFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AppError>> + Send + 'a>>;

/// An alternate way of producing the result, tried when better ones fail.
pub struct FallbackStrategy<'a, T> {
    pub name: String,
    /// Lower runs first; equal priorities keep their given order.
    pub priority: u32,
    /// Feature flag gating this strategy; defaults to `name`.
    pub flag: String,
    run: Box<dyn FnOnce() -> StrategyFuture<'a, T> + Send + 'a>,
}

impl<'a, T> FallbackStrategy<'a, T> {
    pub fn new<F, Fut>(name: impl Into<String>, priority: u32, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, AppError>> + Send + 'a,
    {
        let name = name.into();
        Self {
            flag: name.clone(),
            name,
            priority,
            run: Box::new(move || Box::pin(f())),
        }
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flag = flag.into();
        self
    }
}

impl<T> std::fmt::Debug for FallbackStrategy<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackStrategy")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("flag", &self.flag)
            .finish()
    }
}

/// A result plus the strategy that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Degraded<T> {
    pub value: T,
    /// `"primary"` or the fallback's name.
    pub strategy: String,
}

impl<T> Degraded<T> {
    pub fn is_degraded(&self) -> bool {
        self.strategy != PRIMARY
    }
}

pub const PRIMARY: &str = "primary";

/// Per-operation outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationStats {
    pub primary_successes: u64,
    pub fallback_successes: u64,
    pub total_failures: u64,
    pub skipped_fallbacks: u64,
}

#[derive(Clone)]
pub struct DegradationCoordinator {
    flags: Arc<dyn FeatureFlags>,
    stats: Arc<Mutex<HashMap<String, OperationStats>>>,
}

impl DegradationCoordinator {
    pub fn new(flags: Arc<dyn FeatureFlags>) -> Self {
        Self {
            flags,
            stats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn record(&self, operation: &str, update: impl FnOnce(&mut OperationStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        update(stats.entry(operation.to_string()).or_default());
    }

    /// Run `primary`, falling back through `fallbacks` in priority order.
    pub async fn execute_with_fallback<'a, T, F, Fut>(
        &self,
        operation: &str,
        primary: F,
        fallbacks: Vec<FallbackStrategy<'a, T>>,
    ) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.execute_detailed(operation, primary, fallbacks)
            .await
            .map(|d| d.value)
    }

    /// Like [`execute_with_fallback`](Self::execute_with_fallback), but
    /// reports which strategy produced the value.
    pub async fn execute_detailed<'a, T, F, Fut>(
        &self,
        operation: &str,
        primary: F,
        mut fallbacks: Vec<FallbackStrategy<'a, T>>,
    ) -> Result<Degraded<T>, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut last = match primary().await {
            Ok(value) => {
                self.record(operation, |s| s.primary_successes += 1);
                return Ok(Degraded {
                    value,
                    strategy: PRIMARY.to_string(),
                });
            }
            Err(err) => {
                tracing::warn!(operation, error = %err, "Primary strategy failed, degrading");
                err
            }
        };
        let mut attempts = 1;

        fallbacks.sort_by_key(|f| f.priority);

        for fallback in fallbacks {
            if !self.flags.is_enabled(&fallback.flag) {
                tracing::debug!(
                    operation,
                    fallback = %fallback.name,
                    flag = %fallback.flag,
                    "Fallback disabled by feature flag, skipping"
                );
                self.record(operation, |s| s.skipped_fallbacks += 1);
                continue;
            }

            attempts += 1;
            match (fallback.run)().await {
                Ok(value) => {
                    tracing::info!(operation, fallback = %fallback.name, attempts, "Served by fallback");
                    self.record(operation, |s| s.fallback_successes += 1);
                    return Ok(Degraded {
                        value,
                        strategy: fallback.name,
                    });
                }
                Err(err) => {
                    tracing::warn!(operation, fallback = %fallback.name, error = %err, "Fallback failed");
                    last = err;
                }
            }
        }

        tracing::error!(operation, attempts, error = %last, "All strategies failed");
        self.record(operation, |s| s.total_failures += 1);
        Err(AppError::AllFallbacksFailed {
            operation: operation.to_string(),
            attempts,
            last: Box::new(last),
        })
    }

    pub fn stats(&self, operation: &str) -> OperationStats {
        self.stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(operation)
            .copied()
            .unwrap_or_default()
    }

    pub fn all_stats(&self) -> HashMap<String, OperationStats> {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}
