//! Per-provider and per-caller request quotas.
//!
//! Every scope carries two ceilings at once, a short window (e.g. per minute)
//! and a long window (e.g. per day). Windows are aligned to wall-clock
//! boundaries (`floor(now / width) * width`), so a per-minute window always
//! rolls over at `:00` no matter when the first request arrived.
//!
//! Scope keys are either `provider` (provider-wide) or `provider:user`
//! (per caller). When a caller is known both scopes are checked and both
//! must have capacity.
//!
//! The check-then-increment step is delegated to a [`CounterStore`] as one
//! atomic operation over all involved scopes, so concurrent callers cannot
//! race past a ceiling.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::error::AppError;
use crate::models::compute_hash;

/// A single ceiling: at most `max_requests` per aligned `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl WindowLimit {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn per_hour(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(3600))
    }

    pub fn per_day(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(86_400))
    }

    /// Start of the aligned window containing `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let width = (self.window.as_millis() as i64).max(1);
        let ms = now.timestamp_millis();
        DateTime::from_timestamp_millis(ms - ms.rem_euclid(width)).unwrap_or(now)
    }

    /// Time left until the window containing `now` rolls over.
    pub fn until_reset(&self, now: DateTime<Utc>) -> Duration {
        let end = self.window_start(now) + self.window;
        (end - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// The pair of ceilings applied to one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimits {
    pub short: WindowLimit,
    pub long: WindowLimit,
}

impl WindowLimits {
    pub fn new(short: WindowLimit, long: WindowLimit) -> Self {
        Self { short, long }
    }
}

impl Default for WindowLimits {
    /// 60 per minute, 1000 per day.
    fn default() -> Self {
        Self {
            short: WindowLimit::per_minute(60),
            long: WindowLimit::per_day(1000),
        }
    }
}

/// Limits for one provider: provider-wide, and optionally per caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderLimits {
    pub provider: WindowLimits,
    pub per_user: Option<WindowLimits>,
}

impl ProviderLimits {
    pub fn new(provider: WindowLimits) -> Self {
        Self {
            provider,
            per_user: None,
        }
    }

    pub fn with_per_user(mut self, per_user: WindowLimits) -> Self {
        self.per_user = Some(per_user);
        self
    }
}

/// Rate limiter configuration: a default plus per-provider overrides.
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfig {
    pub default_limits: ProviderLimits,
    pub overrides: HashMap<String, ProviderLimits>,
}

impl RateLimitConfig {
    pub fn new(default_limits: ProviderLimits) -> Self {
        Self {
            default_limits,
            overrides: HashMap::new(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>, limits: ProviderLimits) -> Self {
        self.overrides.insert(provider.into(), limits);
        self
    }
}

/// Longest user id kept verbatim in a [`ScopeKey`].
pub const MAX_SCOPE_USER_LEN: usize = 128;

/// Identifier a ceiling is tracked against: `provider` or `provider:user`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn provider(provider: &str) -> Self {
        Self(provider.to_string())
    }

    /// Ids longer than [`MAX_SCOPE_USER_LEN`] bytes are replaced by their
    /// SHA-256 digest so every key fits a bounded column.
    pub fn user(provider: &str, user_id: &str) -> Self {
        if user_id.len() > MAX_SCOPE_USER_LEN {
            Self(format!("{provider}:sha256:{}", compute_hash(user_id)))
        } else {
            Self(format!("{provider}:{user_id}"))
        }
    }

    pub fn parse(raw: &str) -> Self {
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn provider_name(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(p, _)| p)
    }

    pub fn is_user_scope(&self) -> bool {
        self.0.contains(':')
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Counts consumed in the windows containing a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowUsage {
    pub short_count: u32,
    pub long_count: u32,
}

/// Requests still permitted in each window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Remaining {
    pub short_window: u32,
    pub long_window: u32,
}

impl Remaining {
    pub const UNLIMITED: Remaining = Remaining {
        short_window: u32::MAX,
        long_window: u32::MAX,
    };

    fn from_usage(usage: WindowUsage, limits: &WindowLimits) -> Self {
        Self {
            short_window: limits.short.max_requests.saturating_sub(usage.short_count),
            long_window: limits.long.max_requests.saturating_sub(usage.long_count),
        }
    }

    pub fn permits(&self) -> bool {
        self.short_window > 0 && self.long_window > 0
    }

    /// The more restrictive of two results, window by window.
    pub fn min(self, other: Remaining) -> Remaining {
        Remaining {
            short_window: self.short_window.min(other.short_window),
            long_window: self.long_window.min(other.long_window),
        }
    }
}

/// Backing store for window counters.
///
/// In-memory for single-process deployments ([`MemoryCounterStore`]), or a
/// shared store for multi-process ones. The contract is the same either way.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Usage in the windows containing `now`, without consuming capacity.
    async fn usage(
        &self,
        key: &ScopeKey,
        limits: &WindowLimits,
        now: DateTime<Utc>,
    ) -> Result<WindowUsage, AppError>;

    /// Record one request against `key`, regardless of capacity.
    async fn increment(
        &self,
        key: &ScopeKey,
        limits: &WindowLimits,
        now: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// Atomically: if every scope has capacity in both windows, count one
    /// request against each and return `true`; otherwise change nothing and
    /// return `false`.
    async fn try_acquire(
        &self,
        scopes: &[(ScopeKey, WindowLimits)],
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Drop counters not written since `before`. Returns how many went.
    async fn purge_stale(&self, before: DateTime<Utc>) -> Result<u64, AppError>;
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    short_start: DateTime<Utc>,
    short_count: u32,
    long_start: DateTime<Utc>,
    long_count: u32,
    updated_at: DateTime<Utc>,
}

impl WindowCounter {
    fn new(limits: &WindowLimits, now: DateTime<Utc>) -> Self {
        Self {
            short_start: limits.short.window_start(now),
            short_count: 0,
            long_start: limits.long.window_start(now),
            long_count: 0,
            updated_at: now,
        }
    }

    /// Reset any window that has elapsed.
    fn roll(&mut self, limits: &WindowLimits, now: DateTime<Utc>) {
        let short_start = limits.short.window_start(now);
        if short_start != self.short_start {
            self.short_start = short_start;
            self.short_count = 0;
        }
        let long_start = limits.long.window_start(now);
        if long_start != self.long_start {
            self.long_start = long_start;
            self.long_count = 0;
        }
    }

    fn usage(&self) -> WindowUsage {
        WindowUsage {
            short_count: self.short_count,
            long_count: self.long_count,
        }
    }

    fn has_capacity(&self, limits: &WindowLimits) -> bool {
        self.short_count < limits.short.max_requests && self.long_count < limits.long.max_requests
    }

    fn bump(&mut self, now: DateTime<Utc>) {
        self.short_count = self.short_count.saturating_add(1);
        self.long_count = self.long_count.saturating_add(1);
        self.updated_at = now;
    }
}

/// Process-local counter store. Counters are created lazily on first use
/// and live until [`CounterStore::purge_stale`] drops them.
#[derive(Debug, Default, Clone)]
pub struct MemoryCounterStore {
    counters: Arc<Mutex<HashMap<String, WindowCounter>>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked scopes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, WindowCounter>> {
        self.counters.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate-limit counter mutex");
            poisoned.into_inner()
        })
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn usage(
        &self,
        key: &ScopeKey,
        limits: &WindowLimits,
        now: DateTime<Utc>,
    ) -> Result<WindowUsage, AppError> {
        let mut counters = self.lock();
        Ok(match counters.get_mut(key.as_str()) {
            Some(counter) => {
                counter.roll(limits, now);
                counter.usage()
            }
            None => WindowUsage::default(),
        })
    }

    async fn increment(
        &self,
        key: &ScopeKey,
        limits: &WindowLimits,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut counters = self.lock();
        let counter = counters
            .entry(key.as_str().to_string())
            .or_insert_with(|| WindowCounter::new(limits, now));
        counter.roll(limits, now);
        counter.bump(now);
        Ok(())
    }

    async fn try_acquire(
        &self,
        scopes: &[(ScopeKey, WindowLimits)],
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        // One lock across every scope keeps the check and the increment atomic.
        let mut counters = self.lock();

        for (key, limits) in scopes {
            let counter = counters
                .entry(key.as_str().to_string())
                .or_insert_with(|| WindowCounter::new(limits, now));
            counter.roll(limits, now);
            if !counter.has_capacity(limits) {
                return Ok(false);
            }
        }

        for (key, _) in scopes {
            if let Some(counter) = counters.get_mut(key.as_str()) {
                counter.bump(now);
            }
        }
        Ok(true)
    }

    async fn purge_stale(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let mut counters = self.lock();
        let len = counters.len();
        counters.retain(|_, counter| counter.updated_at >= before);
        Ok((len - counters.len()) as u64)
    }
}

/// Enforces provider-wide and per-caller quotas.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Limiter backed by a process-local store and the system clock.
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_store(Arc::new(MemoryCounterStore::new()), config)
    }

    pub fn with_store(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Drop counters idle for longer than `max_idle`. Pick an idle time
    /// longer than the widest window, or a live count may be forgotten.
    pub async fn purge_stale(&self, max_idle: Duration) -> Result<u64, AppError> {
        let max_idle = chrono::TimeDelta::from_std(max_idle)
            .map_err(|e| AppError::ConfigError(format!("Invalid idle time: {e}")))?;
        let before = self.clock.now() - max_idle;
        self.store.purge_stale(before).await
    }

    pub fn limits_for(&self, provider: &str) -> &ProviderLimits {
        self.config
            .overrides
            .get(provider)
            .unwrap_or(&self.config.default_limits)
    }

    /// Limits tracked for a scope, `None` for a user scope on a provider
    /// without per-user limits.
    fn scope_limits(&self, scope: &ScopeKey) -> Option<WindowLimits> {
        let limits = self.limits_for(scope.provider_name());
        if scope.is_user_scope() {
            limits.per_user
        } else {
            Some(limits.provider)
        }
    }

    /// Every tracked scope involved in a call for `provider` on behalf of `user`.
    fn scopes(&self, provider: &str, user: Option<&str>) -> Vec<(ScopeKey, WindowLimits)> {
        let limits = self.limits_for(provider);
        let mut scopes = vec![(ScopeKey::provider(provider), limits.provider)];
        if let (Some(user), Some(per_user)) = (user, limits.per_user) {
            scopes.push((ScopeKey::user(provider, user), per_user));
        }
        scopes
    }

    /// Whether one more request would currently be permitted for `scope`.
    pub async fn check_limit(&self, scope: &ScopeKey) -> Result<bool, AppError> {
        Ok(self.remaining(scope).await?.permits())
    }

    /// Count one request against `scope`.
    pub async fn increment(&self, scope: &ScopeKey) -> Result<(), AppError> {
        match self.scope_limits(scope) {
            Some(limits) => {
                self.store
                    .increment(scope, &limits, self.clock.now())
                    .await
            }
            None => Ok(()),
        }
    }

    /// Requests still permitted for `scope` in each window.
    pub async fn remaining(&self, scope: &ScopeKey) -> Result<Remaining, AppError> {
        let Some(limits) = self.scope_limits(scope) else {
            return Ok(Remaining::UNLIMITED);
        };
        let usage = self.store.usage(scope, &limits, self.clock.now()).await?;
        Ok(Remaining::from_usage(usage, &limits))
    }

    /// The more restrictive remaining count across provider and user scopes.
    pub async fn remaining_for(
        &self,
        provider: &str,
        user: Option<&str>,
    ) -> Result<Remaining, AppError> {
        let now = self.clock.now();
        let mut remaining = Remaining::UNLIMITED;
        for (key, limits) in self.scopes(provider, user) {
            let usage = self.store.usage(&key, &limits, now).await?;
            remaining = remaining.min(Remaining::from_usage(usage, &limits));
        }
        Ok(remaining)
    }

    /// Atomically check and consume capacity in every involved scope.
    pub async fn try_acquire(&self, provider: &str, user: Option<&str>) -> Result<bool, AppError> {
        let scopes = self.scopes(provider, user);
        self.store.try_acquire(&scopes, self.clock.now()).await
    }

    /// Like [`try_acquire`](Self::try_acquire), but reports the blocking scope
    /// as [`AppError::RateLimitExceeded`].
    pub async fn acquire(&self, provider: &str, user: Option<&str>) -> Result<(), AppError> {
        if self.try_acquire(provider, user).await? {
            return Ok(());
        }

        let now = self.clock.now();
        for (key, limits) in self.scopes(provider, user) {
            let usage = self.store.usage(&key, &limits, now).await?;
            let remaining = Remaining::from_usage(usage, &limits);
            if remaining.permits() {
                continue;
            }
            let mut retry_after = Duration::ZERO;
            if remaining.short_window == 0 {
                retry_after = retry_after.max(limits.short.until_reset(now));
            }
            if remaining.long_window == 0 {
                retry_after = retry_after.max(limits.long.until_reset(now));
            }
            tracing::debug!(scope = %key, retry_after_ms = retry_after.as_millis() as u64, "Rate limit reached");
            return Err(AppError::RateLimitExceeded {
                scope: key.to_string(),
                retry_after,
            });
        }

        // Capacity freed up between the failed acquire and the usage read
        // (a window rolled over); report the provider scope conservatively.
        Err(AppError::RateLimitExceeded {
            scope: provider.to_string(),
            retry_after: Duration::ZERO,
        })
    }
}
