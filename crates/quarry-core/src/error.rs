use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for Quarry.
#[derive(Error, Debug)]
pub enum AppError {
    /// An upstream provider call failed or returned unparseable data.
    #[error("Provider error from {provider}: {message}")]
    ProviderError {
        provider: String,
        message: String,
        status_code: Option<u16>,
        retryable: bool,
    },

    /// A quota ceiling was reached, either locally or reported by the provider.
    #[error("Rate limit exceeded for '{scope}' (retry after {}s)", .retry_after.as_secs())]
    RateLimitExceeded { scope: String, retry_after: Duration },

    /// The breaker guarding a dependency rejected the call without attempting it.
    #[error("Circuit breaker '{name}' is open. Retry after {} seconds.", .retry_after.as_secs())]
    CircuitOpen { name: String, retry_after: Duration },

    /// The retry budget was spent; carries the last underlying error.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<AppError> },

    /// No adapter is registered for the named source.
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// The primary operation and every enabled fallback failed.
    #[error("All strategies failed for '{operation}' ({attempts} attempted): {last}")]
    AllFallbacksFailed {
        operation: String,
        attempts: u32,
        last: Box<AppError>,
    },

    /// Request timed out.
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The search query is malformed (programmer error on the caller side).
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The provider has no listing with this identifier.
    #[error("Job not found: {provider}/{external_id}")]
    JobNotFound {
        provider: String,
        external_id: String,
    },

    /// No registered service matches the request.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl AppError {
    /// Shorthand for a provider failure.
    pub fn provider(
        provider: impl Into<String>,
        message: impl Into<String>,
        status_code: Option<u16>,
        retryable: bool,
    ) -> Self {
        AppError::ProviderError {
            provider: provider.into(),
            message: message.into(),
            status_code,
            retryable,
        }
    }

    /// Returns true if this error is transient and worth retrying within a
    /// backoff budget.
    ///
    /// Quota and breaker rejections are not: another attempt inside the same
    /// window is guaranteed to be rejected again.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::ProviderError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error should count against the circuit breaker.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded { .. } => {
                true
            }
            AppError::ProviderError {
                status_code,
                retryable,
                ..
            } => match status_code {
                // Malformed payloads and transport-level failures carry no status.
                None => true,
                Some(code) => *code == 429 || *code >= 500 || *retryable,
            },
            AppError::RetryExhausted { last, .. } => last.should_trip_circuit(),
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("connection")
            }
            _ => false,
        }
    }

    /// Stable machine-readable label, used in logs, source reports and API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ProviderError { .. } => "provider_error",
            AppError::RateLimitExceeded { .. } => "rate_limited",
            AppError::CircuitOpen { .. } => "circuit_open",
            AppError::RetryExhausted { .. } => "retry_exhausted",
            AppError::UnknownSource(_) => "unknown_source",
            AppError::AllFallbacksFailed { .. } => "all_fallbacks_failed",
            AppError::Timeout(_) => "timeout",
            AppError::HttpError(_) => "http_error",
            AppError::NetworkError(_) => "network_error",
            AppError::InvalidQuery(_) => "invalid_query",
            AppError::JobNotFound { .. } => "not_found",
            AppError::ServiceNotFound(_) => "service_not_found",
            AppError::SerializationError(_) => "serialization_error",
            AppError::ConfigError(_) => "config_error",
            AppError::DatabaseError(_) => "database_error",
        }
    }

    /// How long the caller should wait before trying again, when known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::RateLimitExceeded { retry_after, .. }
            | AppError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            AppError::RetryExhausted { last, .. } | AppError::AllFallbacksFailed { last, .. } => {
                last.retry_after()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(AppError::provider("indeed", "bad gateway", Some(502), true).is_retryable());
        assert!(!AppError::provider("indeed", "bad json", None, false).is_retryable());
        assert!(
            !AppError::RateLimitExceeded {
                scope: "indeed".into(),
                retry_after: Duration::from_secs(10),
            }
            .is_retryable()
        );
        assert!(
            !AppError::CircuitOpen {
                name: "indeed".into(),
                retry_after: Duration::from_secs(10),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_circuit_tripping() {
        assert!(AppError::Timeout(Duration::from_secs(5)).should_trip_circuit());
        assert!(AppError::provider("adzuna", "malformed payload", None, false).should_trip_circuit());
        assert!(AppError::provider("adzuna", "server error", Some(503), true).should_trip_circuit());
        assert!(!AppError::provider("adzuna", "bad request", Some(400), false).should_trip_circuit());
        assert!(!AppError::InvalidQuery("limit".into()).should_trip_circuit());
        assert!(
            !AppError::JobNotFound {
                provider: "adzuna".into(),
                external_id: "1".into(),
            }
            .should_trip_circuit()
        );
    }

    #[test]
    fn test_retry_exhausted_delegates_to_last_error() {
        let tripping = AppError::RetryExhausted {
            attempts: 3,
            last: Box::new(AppError::NetworkError("refused".into())),
        };
        assert!(tripping.should_trip_circuit());
        assert!(!tripping.is_retryable());

        let benign = AppError::RetryExhausted {
            attempts: 3,
            last: Box::new(AppError::provider("adzuna", "gone", Some(410), false)),
        };
        assert!(!benign.should_trip_circuit());
    }

    #[test]
    fn test_retry_after_is_surfaced_through_wrappers() {
        let err = AppError::AllFallbacksFailed {
            operation: "matches".into(),
            attempts: 2,
            last: Box::new(AppError::CircuitOpen {
                name: "ml".into(),
                retry_after: Duration::from_secs(12),
            }),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
        assert_eq!(err.kind(), "all_fallbacks_failed");
    }

    #[test]
    fn test_internal_errors_have_specific_kinds() {
        assert_eq!(AppError::ConfigError("bad".into()).kind(), "config_error");
        assert_eq!(AppError::DatabaseError("down".into()).kind(), "database_error");
        assert!(!AppError::ConfigError("bad".into()).is_retryable());
    }
}
