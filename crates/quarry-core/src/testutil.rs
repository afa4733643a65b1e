//! Test utilities: handwritten doubles for the core traits.
//!
//! All doubles use `Arc<Mutex<_>>` for interior mutability so tests can
//! script responses up front and assert on recorded calls afterwards.
//! Shared with the other workspace crates' integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::{Job, JobSearchQuery, JobSource};
use crate::registry::ServiceDescriptor;
use crate::traits::{ServiceInvoker, SourceAdapter};

type ErrorFactory = Arc<dyn Fn() -> AppError + Send + Sync>;

/// A minimal job for tests.
pub fn sample_job(
    source: JobSource,
    external_id: &str,
    title: &str,
    company: &str,
    posted_at: DateTime<Utc>,
) -> Job {
    Job::builder(source, external_id, title, company)
        .location("Remote")
        .apply_url(format!("https://jobs.example/{}/{}", source, external_id))
        .posted_at(posted_at)
        .build()
}

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

/// Source adapter with scripted responses.
///
/// Each `search` pops the next queued response; once the queue is empty it
/// falls back to the permanent error (if set) or the default job list.
#[derive(Clone)]
pub struct MockAdapter {
    source: JobSource,
    jobs: Arc<Mutex<Vec<Job>>>,
    queued: Arc<Mutex<VecDeque<Result<Vec<Job>, AppError>>>>,
    error: Option<ErrorFactory>,
    delay: Option<Duration>,
    configured: bool,
    search_calls: Arc<AtomicU32>,
    detail_calls: Arc<AtomicU32>,
    last_query: Arc<Mutex<Option<JobSearchQuery>>>,
}

impl MockAdapter {
    pub fn new(source: JobSource) -> Self {
        Self {
            source,
            jobs: Arc::new(Mutex::new(Vec::new())),
            queued: Arc::new(Mutex::new(VecDeque::new())),
            error: None,
            delay: None,
            configured: true,
            search_calls: Arc::new(AtomicU32::new(0)),
            detail_calls: Arc::new(AtomicU32::new(0)),
            last_query: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_jobs(self, jobs: Vec<Job>) -> Self {
        *self.jobs.lock().unwrap() = jobs;
        self
    }

    /// Every call without a queued response fails with a fresh error.
    pub fn failing(mut self, error: impl Fn() -> AppError + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(error));
        self
    }

    pub fn with_responses(self, responses: Vec<Result<Vec<Job>, AppError>>) -> Self {
        self.queued.lock().unwrap().extend(responses);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn unconfigured(mut self) -> Self {
        self.configured = false;
        self
    }

    pub fn search_calls(&self) -> u32 {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> u32 {
        self.detail_calls.load(Ordering::SeqCst)
    }

    pub fn last_query(&self) -> Option<JobSearchQuery> {
        self.last_query.lock().unwrap().clone()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn source(&self) -> JobSource {
        self.source
    }

    async fn search(&self, query: &JobSearchQuery) -> Result<Vec<Job>, AppError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_query.lock().unwrap() = Some(query.clone());
        self.pause().await;

        if let Some(response) = self.queued.lock().unwrap().pop_front() {
            return response;
        }
        match &self.error {
            Some(error) => Err(error()),
            None => Ok(self.jobs.lock().unwrap().clone()),
        }
    }

    async fn job_details(&self, external_id: &str) -> Result<Option<Job>, AppError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        if let Some(error) = &self.error {
            return Err(error());
        }
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.external_id == external_id)
            .cloned())
    }

    fn is_configured(&self) -> bool {
        self.configured
    }
}

// ---------------------------------------------------------------------------
// MockInvoker
// ---------------------------------------------------------------------------

/// A recorded service invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub service: String,
    pub operation: String,
    pub payload: serde_json::Value,
    pub headers: HashMap<String, String>,
}

/// Service invoker with scripted responses per service name.
#[derive(Clone, Default)]
pub struct MockInvoker {
    responses: Arc<Mutex<HashMap<String, VecDeque<Result<serde_json::Value, AppError>>>>>,
    calls: Arc<Mutex<Vec<Invocation>>>,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for calls to the service named `service`.
    pub fn respond(&self, service: &str, response: Result<serde_json::Value, AppError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(service.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceInvoker for MockInvoker {
    async fn invoke(
        &self,
        service: &ServiceDescriptor,
        operation: &str,
        payload: &serde_json::Value,
        headers: &HashMap<String, String>,
    ) -> Result<serde_json::Value, AppError> {
        self.calls.lock().unwrap().push(Invocation {
            service: service.name.clone(),
            operation: operation.to_string(),
            payload: payload.clone(),
            headers: headers.clone(),
        });

        self.responses
            .lock()
            .unwrap()
            .get_mut(&service.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(AppError::NetworkError(format!("{} unreachable", service.name))))
    }
}
