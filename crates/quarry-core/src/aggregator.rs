//! Concurrent fan-out over every registered source adapter.
//!
//! Each adapter call is wrapped, outermost first, in:
//!
//! ```text
//! rate limiter -> circuit breaker -> timeout -> retry policy -> adapter
//! ```
//!
//! The quota is consumed once per logical call, not per retry attempt. The
//! timeout sits inside the breaker so a hung provider counts as a failure,
//! and it bounds the whole retry loop including backoff sleeps.
//!
//! Individual adapter failures never fail a search: the adapter contributes
//! no jobs and the failure is reported in [`SourceReport`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use moka::future::Cache;
use serde::Serialize;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::error::AppError;
use crate::models::{Job, JobFilters, JobSearchQuery, JobSource};
use crate::rate_limit::{RateLimiter, Remaining};
use crate::retry::RetryPolicy;
use crate::trace::{SpanContext, SpanOptions, Tracer};
use crate::traits::SourceAdapter;

/// Tunables for the per-adapter call chain and the result cache.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Upper bound on one adapter call, retries included.
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    /// Result cache lifetime; `None` disables caching.
    pub cache_ttl: Option<Duration>,
    pub cache_capacity: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            cache_ttl: Some(Duration::from_secs(300)),
            cache_capacity: 1_000,
        }
    }
}

/// Who is searching, and which trace the search belongs to.
#[derive(Debug, Clone, Default)]
pub struct SearchContext {
    pub user_id: Option<String>,
    pub trace: Option<SpanContext>,
}

impl SearchContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: Option<SpanContext>) -> Self {
        self.trace = trace;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Ok,
    Failed,
    /// Adapter has no credentials and was not called.
    Skipped,
}

/// How one adapter fared in a search.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: JobSource,
    pub status: SourceStatus,
    pub jobs: usize,
    pub error_kind: Option<&'static str>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Jobs plus per-source diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub jobs: Vec<Job>,
    /// Empty when served from cache.
    pub reports: Vec<SourceReport>,
    pub cached: bool,
}

/// Health and quota view of one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceOverview {
    pub source: JobSource,
    pub configured: bool,
    pub circuit: CircuitBreakerStats,
    pub rate_limit: Option<Remaining>,
}

struct RegisteredAdapter {
    adapter: Arc<dyn SourceAdapter>,
    breaker: CircuitBreaker,
}

pub struct JobAggregator {
    adapters: Vec<RegisteredAdapter>,
    rate_limiter: Arc<RateLimiter>,
    tracer: Tracer,
    config: AggregatorConfig,
    cache: Option<Cache<String, Arc<Vec<Job>>>>,
}

impl JobAggregator {
    pub fn new(config: AggregatorConfig, rate_limiter: Arc<RateLimiter>, tracer: Tracer) -> Self {
        let cache = config.cache_ttl.map(|ttl| {
            Cache::builder()
                .max_capacity(config.cache_capacity)
                .time_to_live(ttl)
                .build()
        });
        Self {
            adapters: Vec::new(),
            rate_limiter,
            tracer,
            config,
            cache,
        }
    }

    /// Register an adapter. Registration order is the merge order; a second
    /// adapter for the same source replaces the first in place.
    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        let source = adapter.source();
        let registered = RegisteredAdapter {
            breaker: CircuitBreaker::new(source.as_str(), self.config.breaker.clone()),
            adapter,
        };
        match self
            .adapters
            .iter_mut()
            .find(|r| r.adapter.source() == source)
        {
            Some(existing) => *existing = registered,
            None => self.adapters.push(registered),
        }
        self
    }

    pub fn sources(&self) -> Vec<JobSource> {
        self.adapters.iter().map(|r| r.adapter.source()).collect()
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn circuit_stats(&self) -> Vec<CircuitBreakerStats> {
        self.adapters.iter().map(|r| r.breaker.stats()).collect()
    }

    pub async fn rate_limit_remaining(
        &self,
        source: JobSource,
        user_id: Option<&str>,
    ) -> Result<Remaining, AppError> {
        self.rate_limiter
            .remaining_for(source.as_str(), user_id)
            .await
    }

    /// Circuit and quota state for every registered source.
    pub async fn source_overview(&self, user_id: Option<&str>) -> Vec<SourceOverview> {
        let mut overview = Vec::with_capacity(self.adapters.len());
        for registered in &self.adapters {
            let source = registered.adapter.source();
            let rate_limit = match self.rate_limit_remaining(source, user_id).await {
                Ok(remaining) => Some(remaining),
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "Could not read rate-limit usage");
                    None
                }
            };
            overview.push(SourceOverview {
                source,
                configured: registered.adapter.is_configured(),
                circuit: registered.breaker.stats(),
                rate_limit,
            });
        }
        overview
    }

    /// Search every source and return merged, deduplicated, filtered and
    /// sorted jobs. Only an invalid query is an error.
    pub async fn search_jobs(
        &self,
        query: &JobSearchQuery,
        ctx: &SearchContext,
    ) -> Result<Vec<Job>, AppError> {
        Ok(self.search_jobs_detailed(query, ctx).await?.jobs)
    }

    pub async fn search_jobs_detailed(
        &self,
        query: &JobSearchQuery,
        ctx: &SearchContext,
    ) -> Result<SearchOutcome, AppError> {
        query.validate()?;

        let span = self.tracer.create_span(
            SpanOptions::new("jobs.search")
                .child_of(ctx.trace.as_ref())
                .with_tag("keywords", query.keywords.clone()),
        );
        let span_ctx = span.context();

        let cache_key = query.cache_key();
        if let Some(cache) = &self.cache
            && let Some(jobs) = cache.get(&cache_key).await
        {
            tracing::debug!(cache_key = %cache_key, jobs = jobs.len(), "Search served from cache");
            self.tracer.finish_span(
                span,
                [("cache".to_string(), "hit".to_string())].into(),
            );
            return Ok(SearchOutcome {
                jobs: jobs.as_ref().clone(),
                reports: Vec::new(),
                cached: true,
            });
        }

        let calls = self
            .adapters
            .iter()
            .map(|registered| self.search_one(registered, query, ctx, &span_ctx));
        let results = join_all(calls).await;

        let mut reports = Vec::with_capacity(results.len());
        let mut batches = Vec::with_capacity(results.len());
        for (report, jobs) in results {
            reports.push(report);
            batches.push(jobs);
        }

        let jobs = merge_results(batches, &query.filters);
        let succeeded = reports.iter().filter(|r| r.status == SourceStatus::Ok).count();
        let complete = succeeded > 0 && reports.iter().all(|r| r.status != SourceStatus::Failed);

        tracing::info!(
            keywords = %query.keywords,
            sources = reports.len(),
            succeeded,
            jobs = jobs.len(),
            "Aggregated search finished"
        );

        // A partial result would hide a recovering source for the whole TTL.
        if complete
            && let Some(cache) = &self.cache
        {
            cache.insert(cache_key, Arc::new(jobs.clone())).await;
        }

        self.tracer.finish_span(
            span,
            [
                ("jobs".to_string(), jobs.len().to_string()),
                ("sources.ok".to_string(), succeeded.to_string()),
            ]
            .into(),
        );

        Ok(SearchOutcome {
            jobs,
            reports,
            cached: false,
        })
    }

    async fn search_one(
        &self,
        registered: &RegisteredAdapter,
        query: &JobSearchQuery,
        ctx: &SearchContext,
        parent: &SpanContext,
    ) -> (SourceReport, Vec<Job>) {
        let source = registered.adapter.source();
        let started = Instant::now();

        if !registered.adapter.is_configured() {
            tracing::debug!(source = %source, "Adapter not configured, skipping");
            let report = SourceReport {
                source,
                status: SourceStatus::Skipped,
                jobs: 0,
                error_kind: None,
                error: None,
                elapsed_ms: 0,
            };
            return (report, Vec::new());
        }

        let operation = format!("{source}.search");
        let result = self
            .tracer
            .trace_async_operation(&operation, Some(parent), |_| {
                self.guarded(registered, ctx.user_id.as_deref(), &operation, || {
                    registered.adapter.search(query)
                })
            })
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(jobs) => {
                tracing::debug!(source = %source, jobs = jobs.len(), elapsed_ms, "Source search succeeded");
                let report = SourceReport {
                    source,
                    status: SourceStatus::Ok,
                    jobs: jobs.len(),
                    error_kind: None,
                    error: None,
                    elapsed_ms,
                };
                (report, jobs)
            }
            Err(e) => {
                tracing::warn!(
                    source = %source,
                    kind = e.kind(),
                    error = %e,
                    elapsed_ms,
                    "Source search failed, continuing without it"
                );
                let report = SourceReport {
                    source,
                    status: SourceStatus::Failed,
                    jobs: 0,
                    error_kind: Some(e.kind()),
                    error: Some(e.to_string()),
                    elapsed_ms,
                };
                (report, Vec::new())
            }
        }
    }

    /// Fetch one listing from its source. Unlike searches, failures propagate.
    pub async fn get_job_details(
        &self,
        source: JobSource,
        external_id: &str,
        ctx: &SearchContext,
    ) -> Result<Job, AppError> {
        let registered = self
            .adapters
            .iter()
            .find(|r| r.adapter.source() == source)
            .ok_or_else(|| AppError::UnknownSource(source.to_string()))?;

        let operation = format!("{source}.details");
        let found = self
            .tracer
            .trace_async_operation(&operation, ctx.trace.as_ref(), |_| {
                self.guarded(registered, ctx.user_id.as_deref(), &operation, || {
                    registered.adapter.job_details(external_id)
                })
            })
            .await?;

        found.ok_or_else(|| AppError::JobNotFound {
            provider: source.to_string(),
            external_id: external_id.to_string(),
        })
    }

    /// Rate limit, then breaker around a timeout-bounded retry loop.
    async fn guarded<T, F, Fut>(
        &self,
        registered: &RegisteredAdapter,
        user_id: Option<&str>,
        operation: &str,
        call: F,
    ) -> Result<T, AppError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let provider = registered.adapter.source();
        self.rate_limiter.acquire(provider.as_str(), user_id).await?;

        let timeout = self.config.call_timeout;
        let retry = &self.config.retry;
        let result = registered
            .breaker
            .call(|| async {
                match tokio::time::timeout(timeout, retry.execute(operation, &call)).await {
                    Ok(result) => result,
                    Err(_) => Err(AppError::Timeout(timeout)),
                }
            })
            .await;

        result.map_err(AppError::from)
    }
}

/// Merge per-source batches in the order given, apply filters, drop
/// duplicates (first matching copy wins), then sort newest first with a
/// stable tie-break.
pub fn merge_results(batches: Vec<Vec<Job>>, filters: &JobFilters) -> Vec<Job> {
    let mut seen = HashSet::new();
    let mut jobs: Vec<Job> = batches
        .into_iter()
        .flatten()
        .filter(|job| filters.matches(job))
        .filter(|job| seen.insert(job.dedup_key()))
        .collect();

    jobs.sort_by(|a, b| {
        b.posted_at
            .cmp(&a.posted_at)
            .then_with(|| a.source.as_str().cmp(b.source.as_str()))
            .then_with(|| a.external_id.cmp(&b.external_id))
    });
    jobs
}
