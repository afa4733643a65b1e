use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use quarry_core::error::AppError;

use crate::dto::ErrorResponse;

/// Wrapper so we can implement `IntoResponse` for `AppError`.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

/// Status for an error. A spent retry budget answers with the status of the
/// failure that exhausted it.
fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::InvalidQuery(_) | AppError::SerializationError(_) => StatusCode::BAD_REQUEST,
        AppError::UnknownSource(_) | AppError::JobNotFound { .. } | AppError::ServiceNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        AppError::CircuitOpen { .. } | AppError::AllFallbacksFailed { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        AppError::RetryExhausted { last, .. } => status_for(last),
        AppError::ProviderError { .. } | AppError::NetworkError(_) | AppError::HttpError(_) => {
            StatusCode::BAD_GATEWAY
        }
        AppError::ConfigError(_) | AppError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!(kind = self.0.kind(), error = %self.0, "Request failed");
        }

        let body = ErrorResponse {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
        };
        let mut response = (status, axum::Json(body)).into_response();

        if let Some(retry_after) = self.0.retry_after() {
            // Round up so clients never retry a moment too early.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}
