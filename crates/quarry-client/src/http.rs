//! Shared request plumbing for the HTTP adapters.

use std::time::Duration;

use quarry_core::error::AppError;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

pub(crate) const USER_AGENT: &str = concat!("Quarry/", env!("CARGO_PKG_VERSION"));
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Used when a 429 response carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

pub(crate) fn build_client(timeout: Duration) -> Result<Client, AppError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::HttpError(e.to_string()))
}

/// Map a transport failure (no response received).
pub(crate) fn send_error(provider: &str, e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout)
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection to {provider} failed: {e}"))
    } else {
        AppError::provider(provider, e.to_string(), None, true)
    }
}

/// Turn a non-success status into the matching error.
///
/// 429 becomes `RateLimitExceeded` scoped to the provider, 5xx a retryable
/// provider error, anything else a permanent one.
pub(crate) async fn check_status(provider: &str, response: Response) -> Result<Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER);
        return Err(AppError::RateLimitExceeded {
            scope: provider.to_string(),
            retry_after,
        });
    }

    let code = status.as_u16();
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    Err(AppError::provider(
        provider,
        format!("HTTP {code}: {snippet}"),
        Some(code),
        status.is_server_error(),
    ))
}

/// Read and decode a JSON body. A payload that does not decode is a
/// permanent provider error; it carries no status so the breaker still
/// counts it.
pub(crate) async fn read_json<T: DeserializeOwned>(
    provider: &str,
    response: Response,
) -> Result<T, AppError> {
    let body = response
        .text()
        .await
        .map_err(|e| AppError::provider(provider, format!("Failed to read body: {e}"), None, true))?;
    serde_json::from_str(&body)
        .map_err(|e| AppError::provider(provider, format!("Malformed response: {e}"), None, false))
}
