use std::time::Duration;

use crate::aggregator::AggregatorConfig;
use crate::error::AppError;
use crate::models::JobSource;
use crate::rate_limit::{ProviderLimits, RateLimitConfig, WindowLimit, WindowLimits};

/// Runtime configuration for the aggregation engine.
#[derive(Debug, Clone, Default)]
pub struct QuarryConfig {
    pub aggregator: AggregatorConfig,
    pub rate_limits: RateLimitConfig,
    pub service_timeout: Duration,
}

impl QuarryConfig {
    /// Read configuration from environment variables. Every variable is
    /// optional; unset means the default.
    ///
    /// - `QUARRY_CALL_TIMEOUT_MS` (10000): per-adapter bound, retries included
    /// - `QUARRY_RETRY_MAX_ATTEMPTS` (3), `QUARRY_RETRY_INITIAL_DELAY_MS` (200),
    ///   `QUARRY_RETRY_MAX_DELAY_MS` (5000)
    /// - `QUARRY_BREAKER_FAILURE_THRESHOLD` (5), `QUARRY_BREAKER_SUCCESS_THRESHOLD` (1),
    ///   `QUARRY_BREAKER_HALF_OPEN_MAX_CALLS` (1), `QUARRY_BREAKER_RECOVERY_SECS` (30)
    /// - `QUARRY_RATE_LIMIT_PER_MINUTE` (60), `QUARRY_RATE_LIMIT_PER_DAY` (1000)
    /// - `QUARRY_RATE_LIMIT_<SOURCE>_PER_MINUTE` / `_PER_DAY`: per-provider override
    /// - `QUARRY_USER_RATE_LIMIT_PER_MINUTE` / `_PER_DAY`: per-caller limits (off when unset)
    /// - `QUARRY_CACHE_TTL_SECS` (300, `0` disables the result cache)
    /// - `QUARRY_SERVICE_TIMEOUT_MS` (5000): internal service calls
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let vars = Vars(&lookup);
        let mut config = Self {
            service_timeout: Duration::from_secs(5),
            ..Default::default()
        };

        let agg = &mut config.aggregator;
        if let Some(ms) = vars.positive("QUARRY_CALL_TIMEOUT_MS")? {
            agg.call_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = vars.positive("QUARRY_RETRY_MAX_ATTEMPTS")? {
            agg.retry.max_attempts = n as u32;
        }
        if let Some(ms) = vars.number("QUARRY_RETRY_INITIAL_DELAY_MS")? {
            agg.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = vars.number("QUARRY_RETRY_MAX_DELAY_MS")? {
            agg.retry.max_delay = Duration::from_millis(ms);
        }
        if agg.retry.max_delay < agg.retry.initial_delay {
            return Err(AppError::ConfigError(
                "QUARRY_RETRY_MAX_DELAY_MS must not be below QUARRY_RETRY_INITIAL_DELAY_MS".into(),
            ));
        }
        if let Some(n) = vars.positive("QUARRY_BREAKER_FAILURE_THRESHOLD")? {
            agg.breaker.failure_threshold = n as u32;
        }
        if let Some(n) = vars.positive("QUARRY_BREAKER_SUCCESS_THRESHOLD")? {
            agg.breaker.success_threshold = n as u32;
        }
        if let Some(n) = vars.positive("QUARRY_BREAKER_HALF_OPEN_MAX_CALLS")? {
            agg.breaker.half_open_max_calls = n as u32;
        }
        if let Some(secs) = vars.positive("QUARRY_BREAKER_RECOVERY_SECS")? {
            agg.breaker.recovery_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = vars.number("QUARRY_CACHE_TTL_SECS")? {
            agg.cache_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(ms) = vars.positive("QUARRY_SERVICE_TIMEOUT_MS")? {
            config.service_timeout = Duration::from_millis(ms);
        }

        let default_limits = vars.window_limits("QUARRY_RATE_LIMIT", WindowLimits::default())?;
        let per_user = match (
            vars.positive("QUARRY_USER_RATE_LIMIT_PER_MINUTE")?,
            vars.positive("QUARRY_USER_RATE_LIMIT_PER_DAY")?,
        ) {
            (None, None) => None,
            (minute, day) => Some(WindowLimits::new(
                WindowLimit::per_minute(minute.map_or(u32::MAX, |n| n as u32)),
                WindowLimit::per_day(day.map_or(u32::MAX, |n| n as u32)),
            )),
        };

        let mut rate_limits = RateLimitConfig::new(ProviderLimits {
            provider: default_limits,
            per_user,
        });
        for source in JobSource::ALL {
            let prefix = format!("QUARRY_RATE_LIMIT_{}", source.as_str().to_uppercase());
            let limits = vars.window_limits(&prefix, default_limits)?;
            if limits != default_limits {
                rate_limits = rate_limits.with_provider(
                    source.as_str(),
                    ProviderLimits {
                        provider: limits,
                        per_user,
                    },
                );
            }
        }
        config.rate_limits = rate_limits;

        Ok(config)
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn number(&self, key: &str) -> Result<Option<u64>, AppError> {
        match (self.0)(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                AppError::ConfigError(format!("Invalid {key} '{raw}': must be a non-negative integer"))
            }),
        }
    }

    fn positive(&self, key: &str) -> Result<Option<u64>, AppError> {
        match self.number(key)? {
            Some(0) => Err(AppError::ConfigError(format!("{key} must be at least 1"))),
            other => Ok(other),
        }
    }

    fn window_limits(&self, prefix: &str, base: WindowLimits) -> Result<WindowLimits, AppError> {
        let clamp = |n: u64| n.min(u64::from(u32::MAX)) as u32;
        let mut limits = base;
        if let Some(n) = self.positive(&format!("{prefix}_PER_MINUTE"))? {
            limits.short = WindowLimit::per_minute(clamp(n));
        }
        if let Some(n) = self.positive(&format!("{prefix}_PER_DAY"))? {
            limits.long = WindowLimit::per_day(clamp(n));
        }
        Ok(limits)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<QuarryConfig, AppError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        QuarryConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.aggregator.call_timeout, Duration::from_secs(10));
        assert_eq!(config.aggregator.retry.max_attempts, 3);
        assert_eq!(config.aggregator.breaker.failure_threshold, 5);
        assert_eq!(config.aggregator.cache_ttl, Some(Duration::from_secs(300)));
        assert_eq!(config.service_timeout, Duration::from_secs(5));
        assert_eq!(config.rate_limits.default_limits.provider, WindowLimits::default());
        assert!(config.rate_limits.default_limits.per_user.is_none());
        assert!(config.rate_limits.overrides.is_empty());
    }

    #[test]
    fn reads_overrides() {
        let config = config_from(&[
            ("QUARRY_CALL_TIMEOUT_MS", "2500"),
            ("QUARRY_BREAKER_FAILURE_THRESHOLD", "3"),
            ("QUARRY_CACHE_TTL_SECS", "0"),
            ("QUARRY_RATE_LIMIT_PER_MINUTE", "30"),
            ("QUARRY_RATE_LIMIT_ADZUNA_PER_DAY", "250"),
            ("QUARRY_USER_RATE_LIMIT_PER_MINUTE", "5"),
        ])
        .unwrap();

        assert_eq!(config.aggregator.call_timeout, Duration::from_millis(2500));
        assert_eq!(config.aggregator.breaker.failure_threshold, 3);
        assert!(config.aggregator.cache_ttl.is_none());
        assert_eq!(config.rate_limits.default_limits.provider.short.max_requests, 30);

        let adzuna = config.rate_limits.overrides["adzuna"];
        assert_eq!(adzuna.provider.short.max_requests, 30);
        assert_eq!(adzuna.provider.long.max_requests, 250);
        assert_eq!(adzuna.per_user.unwrap().short.max_requests, 5);
        assert_eq!(config.rate_limits.overrides.len(), 1);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            config_from(&[("QUARRY_CALL_TIMEOUT_MS", "soon")]),
            Err(AppError::ConfigError(_))
        ));
        assert!(matches!(
            config_from(&[("QUARRY_RATE_LIMIT_PER_MINUTE", "0")]),
            Err(AppError::ConfigError(_))
        ));
        assert!(matches!(
            config_from(&[
                ("QUARRY_RETRY_INITIAL_DELAY_MS", "1000"),
                ("QUARRY_RETRY_MAX_DELAY_MS", "10"),
            ]),
            Err(AppError::ConfigError(_))
        ));
    }
}
