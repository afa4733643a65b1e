use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use quarry_core::error::AppError;
use quarry_core::models::{EmploymentType, Job, JobFilters, JobSearchQuery, RemoteType};
use quarry_core::{
    CircuitBreakerStats, JobMatch, NewService, Remaining, ServiceDescriptor, ServiceMetrics,
    ServiceStatus, SourceOverview, SourceReport, Span,
};

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct SearchParams {
    /// Free-text keywords
    #[serde(default)]
    pub q: String,
    pub location: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
    /// remote, hybrid or onsite
    pub remote_type: Option<String>,
    /// full_time, part_time, contract or internship
    pub employment_type: Option<String>,
    pub min_salary: Option<f64>,
}

impl SearchParams {
    pub fn into_query(self) -> Result<JobSearchQuery, AppError> {
        let defaults = JobSearchQuery::default();
        let filters = JobFilters {
            remote_type: parse_opt::<RemoteType>(self.remote_type)?,
            employment_type: parse_opt::<EmploymentType>(self.employment_type)?,
            min_salary: self.min_salary,
        };
        let query = JobSearchQuery {
            keywords: self.q,
            location: self.location.filter(|l| !l.trim().is_empty()),
            page: self.page.unwrap_or(defaults.page),
            limit: self.limit.unwrap_or(defaults.limit),
            filters,
        };
        query.validate()?;
        Ok(query)
    }
}

fn parse_opt<T: std::str::FromStr<Err = String>>(
    value: Option<String>,
) -> Result<Option<T>, AppError> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.parse().map_err(AppError::InvalidQuery))
        .transpose()
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SalaryResponse {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub currency: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobResponse {
    pub id: String,
    pub external_id: String,
    pub source: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub remote_type: String,
    pub employment_type: String,
    pub salary: Option<SalaryResponse>,
    pub description: String,
    pub requirements: Vec<String>,
    pub responsibilities: Vec<String>,
    pub benefits: Vec<String>,
    pub posted_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub apply_url: String,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            external_id: job.external_id,
            source: job.source.to_string(),
            title: job.title,
            company: job.company,
            location: job.location,
            remote_type: job.remote_type.to_string(),
            employment_type: job.employment_type.to_string(),
            salary: job.salary.map(|s| SalaryResponse {
                min: s.min,
                max: s.max,
                currency: s.currency,
            }),
            description: job.description,
            requirements: job.requirements,
            responsibilities: job.responsibilities,
            benefits: job.benefits,
            posted_at: job.posted_at,
            deadline: job.deadline,
            apply_url: job.apply_url,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SourceReportResponse {
    pub source: String,
    /// ok, failed or skipped
    pub status: String,
    pub jobs: usize,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl From<SourceReport> for SourceReportResponse {
    fn from(report: SourceReport) -> Self {
        let status = serde_json::to_value(report.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            source: report.source.to_string(),
            status,
            jobs: report.jobs,
            error_kind: report.error_kind.map(str::to_string),
            error: report.error,
            elapsed_ms: report.elapsed_ms,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SearchResponse {
    pub jobs: Vec<JobResponse>,
    pub total: usize,
    /// Per-source outcome; empty when the result came from cache.
    pub sources: Vec<SourceReportResponse>,
    pub cached: bool,
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CircuitResponse {
    pub name: String,
    /// closed, open or half-open
    pub state: String,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub last_error: Option<String>,
    pub seconds_until_half_open: Option<u64>,
}

impl From<CircuitBreakerStats> for CircuitResponse {
    fn from(stats: CircuitBreakerStats) -> Self {
        Self {
            name: stats.name,
            state: stats.state.as_str().to_string(),
            consecutive_failures: stats.failure_count,
            half_open_successes: stats.success_count,
            total_successes: stats.total_successes,
            total_failures: stats.total_failures,
            total_rejections: stats.total_rejections,
            last_error: stats.last_error,
            seconds_until_half_open: stats.time_until_half_open.map(|d| d.as_secs()),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RemainingResponse {
    /// `null` when the scope is not limited.
    pub short_window: Option<u32>,
    pub long_window: Option<u32>,
}

impl From<Remaining> for RemainingResponse {
    fn from(r: Remaining) -> Self {
        let finite = |n: u32| (n != u32::MAX).then_some(n);
        Self {
            short_window: finite(r.short_window),
            long_window: finite(r.long_window),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SourceResponse {
    pub source: String,
    pub configured: bool,
    pub circuit: CircuitResponse,
    pub rate_limit: Option<RemainingResponse>,
}

impl From<SourceOverview> for SourceResponse {
    fn from(o: SourceOverview) -> Self {
        Self {
            source: o.source.to_string(),
            configured: o.configured,
            circuit: o.circuit.into(),
            rate_limit: o.rate_limit.map(Into::into),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SourceListResponse {
    pub sources: Vec<SourceResponse>,
}

// ---------------------------------------------------------------------------
// Matches
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct MatchRequestBody {
    #[serde(default)]
    pub profile_keywords: Vec<String>,
    #[serde(default)]
    pub keywords: String,
    pub location: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobMatchResponse {
    pub job: JobResponse,
    pub score: f64,
    pub matched_keywords: Vec<String>,
}

impl From<JobMatch> for JobMatchResponse {
    fn from(m: JobMatch) -> Self {
        Self {
            job: m.job.into(),
            score: m.score,
            matched_keywords: m.matched_keywords,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct MatchResponse {
    pub matches: Vec<JobMatchResponse>,
    /// primary, aggregator or static
    pub strategy: String,
    pub degraded: bool,
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ServiceFilter {
    pub capability: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RegisterServiceRequest {
    pub name: String,
    pub address: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub weight: Option<u32>,
    /// healthy, unhealthy or unknown (default)
    pub status: Option<String>,
}

impl RegisterServiceRequest {
    pub fn into_new_service(self) -> Result<NewService, AppError> {
        if self.name.trim().is_empty() || self.address.trim().is_empty() {
            return Err(AppError::InvalidQuery(
                "name and address are required".into(),
            ));
        }
        let mut service = NewService::new(self.name, self.address, self.version);
        for capability in self.capabilities {
            service = service.with_capability(capability);
        }
        if let Some(weight) = self.weight {
            service = service.with_weight(weight);
        }
        if let Some(status) = self.status {
            service = service.with_status(parse_status(&status)?);
        }
        Ok(service)
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct UpdateStatusRequest {
    /// healthy, unhealthy or unknown
    pub status: String,
    pub response_time_ms: Option<u64>,
}

pub fn parse_status(value: &str) -> Result<ServiceStatus, AppError> {
    value
        .parse::<ServiceStatus>()
        .map_err(|_| AppError::InvalidQuery(format!("Unknown service status: {value}")))
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ServiceResponse {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub version: String,
    pub status: String,
    pub capabilities: Vec<String>,
    pub response_time_ms: Option<u64>,
    pub weight: u32,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ServiceDescriptor> for ServiceResponse {
    fn from(s: ServiceDescriptor) -> Self {
        Self {
            id: s.id,
            name: s.name,
            address: s.address,
            version: s.version,
            status: s.status.to_string(),
            capabilities: s.capabilities.into_iter().collect(),
            response_time_ms: s.response_time_ms,
            weight: s.weight,
            registered_at: s.registered_at,
            updated_at: s.updated_at,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ServiceListResponse {
    pub services: Vec<ServiceResponse>,
    pub total: usize,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ServiceMetricsResponse {
    pub total_services: usize,
    pub healthy_services: usize,
    pub services_by_capability: BTreeMap<String, usize>,
}

impl From<ServiceMetrics> for ServiceMetricsResponse {
    fn from(m: ServiceMetrics) -> Self {
        Self {
            total_services: m.total_services,
            healthy_services: m.healthy_services,
            services_by_capability: m.services_by_capability,
        }
    }
}

// ---------------------------------------------------------------------------
// Traces
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SpanResponse {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub operation: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: bool,
    pub tags: HashMap<String, String>,
}

impl From<Span> for SpanResponse {
    fn from(span: Span) -> Self {
        Self {
            duration_ms: span.duration_ms(),
            error: span.is_error(),
            trace_id: span.trace_id,
            span_id: span.span_id,
            parent_span_id: span.parent_span_id,
            operation: span.operation,
            start_time: span.start_time,
            end_time: span.end_time,
            tags: span.tags,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct TraceResponse {
    pub trace_id: String,
    pub spans: Vec<SpanResponse>,
}

// ---------------------------------------------------------------------------
// Health / errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SourceHealth {
    pub source: String,
    pub circuit: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    /// `healthy`, or `degraded` when any source circuit is not closed.
    pub status: String,
    pub version: String,
    pub sources: Vec<SourceHealth>,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
