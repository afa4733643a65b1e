use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::AppError;
use crate::models::{Job, JobSearchQuery, JobSource};
use crate::registry::ServiceDescriptor;

/// Translates one provider's API into normalized [`Job`]s.
///
/// Implementations own their credentials and request construction and
/// must not block past their own client timeout. Failures are reported as
/// typed errors, never as truncated or fabricated results.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> JobSource;

    /// Search the provider. An adapter without credentials returns an empty
    /// list rather than an error.
    async fn search(&self, query: &JobSearchQuery) -> Result<Vec<Job>, AppError>;

    /// Fetch a single listing; `Ok(None)` when the provider has no such id.
    async fn job_details(&self, external_id: &str) -> Result<Option<Job>, AppError>;

    /// Whether the adapter has what it needs to call its provider.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Transport used to invoke an operation on an internal service.
#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    async fn invoke(
        &self,
        service: &ServiceDescriptor,
        operation: &str,
        payload: &serde_json::Value,
        headers: &HashMap<String, String>,
    ) -> Result<serde_json::Value, AppError>;
}
