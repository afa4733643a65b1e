use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use quarry_core::error::AppError;
use quarry_core::models::{JobSearchQuery, JobSource};
use quarry_core::trace::TRACEPARENT_HEADER;
use quarry_core::{CircuitState, MatchRequest, SearchContext, SpanContext, Tracer};

use crate::auth::require_admin_token;
use crate::dto::{
    ErrorResponse, HealthResponse, JobMatchResponse, JobResponse, MatchRequestBody,
    MatchResponse, RegisterServiceRequest, SearchParams, SearchResponse, ServiceFilter,
    ServiceListResponse, ServiceMetricsResponse, ServiceResponse, SourceHealth,
    SourceListResponse, SourceReportResponse, SourceResponse, SpanResponse, TraceResponse,
    UpdateStatusRequest, parse_status,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

const USER_ID_HEADER: &str = "x-user-id";
const MAX_BODY_BYTES: usize = 64 * 1024;
const MAX_USER_ID_BYTES: usize = 128;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/v1/services", post(register_service))
        .route("/v1/services/{id}", delete(deregister_service))
        .route("/v1/services/{id}/status", put(update_service_status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .route("/v1/jobs/search", get(search_jobs))
        .route("/v1/jobs/{source}/{external_id}", get(get_job_details))
        .route("/v1/sources", get(list_sources))
        .route("/v1/matches", post(get_matches))
        .route("/v1/services", get(list_services))
        .route("/v1/services/metrics", get(service_metrics))
        .route("/v1/services/{id}", get(get_service))
        .route("/v1/traces/{trace_id}", get(get_trace))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public
        .merge(admin)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

/// The caller named by `x-user-id`. It keys a rate-limit scope, so its
/// length is bounded.
fn user_id(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    let Some(user) = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    else {
        return Ok(None);
    };
    if user.len() > MAX_USER_ID_BYTES {
        return Err(AppError::InvalidQuery(format!(
            "{USER_ID_HEADER} must be at most {MAX_USER_ID_BYTES} bytes"
        )));
    }
    Ok(Some(user.to_string()))
}

/// An incoming `traceparent`; a malformed one starts a fresh trace.
fn parent_context(headers: &HeaderMap) -> Option<SpanContext> {
    headers
        .get(TRACEPARENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(SpanContext::from_traceparent)
}

/// Run a handler body inside a request span and echo the span as
/// `traceparent` on the response, success or not.
async fn traced<T, F, Fut>(
    tracer: Tracer,
    operation: &str,
    headers: &HeaderMap,
    f: F,
) -> axum::response::Response
where
    T: IntoResponse,
    F: FnOnce(SpanContext) -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let parent = parent_context(headers);
    let mut current = None;
    let result = tracer
        .trace_async_operation(operation, parent.as_ref(), |ctx| {
            current = Some(ctx.clone());
            f(ctx)
        })
        .await;

    let mut response = match result {
        Ok(value) => value.into_response(),
        Err(err) => ApiError(err).into_response(),
    };
    if let Some(ctx) = current
        && let Ok(value) = HeaderValue::from_str(&ctx.to_traceparent())
    {
        response.headers_mut().insert(TRACEPARENT_HEADER, value);
    }
    response
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/jobs/search",
    params(SearchParams),
    responses(
        (status = 200, description = "Merged results from every source", body = SearchResponse),
        (status = 400, description = "Invalid query", body = ErrorResponse),
    ),
    tag = "jobs"
)]
pub async fn search_jobs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> impl IntoResponse {
    let user = user_id(&headers);
    traced(state.tracer.clone(), "http.search_jobs", &headers, |ctx| async move {
        let query = params.into_query()?;
        let search_ctx = SearchContext {
            user_id: user?,
            trace: Some(ctx),
        };
        let outcome = state
            .aggregator
            .search_jobs_detailed(&query, &search_ctx)
            .await?;

        Ok(axum::Json(SearchResponse {
            total: outcome.jobs.len(),
            jobs: outcome.jobs.into_iter().map(JobResponse::from).collect(),
            sources: outcome
                .reports
                .into_iter()
                .map(SourceReportResponse::from)
                .collect(),
            cached: outcome.cached,
        }))
    })
    .await
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{source}/{external_id}",
    params(
        ("source" = String, Path, description = "Source name, e.g. remoteok"),
        ("external_id" = String, Path, description = "Listing id at the source"),
    ),
    responses(
        (status = 200, description = "Job details", body = JobResponse),
        (status = 400, description = "Invalid x-user-id header", body = ErrorResponse),
        (status = 404, description = "Unknown source or listing", body = ErrorResponse),
        (status = 429, description = "Rate limited", body = ErrorResponse),
        (status = 503, description = "Source circuit open", body = ErrorResponse),
    ),
    tag = "jobs"
)]
pub async fn get_job_details(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((source, external_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let user = user_id(&headers);
    traced(state.tracer.clone(), "http.get_job_details", &headers, |ctx| async move {
        let source: JobSource = source.parse()?;
        let search_ctx = SearchContext {
            user_id: user?,
            trace: Some(ctx),
        };
        let job = state
            .aggregator
            .get_job_details(source, &external_id, &search_ctx)
            .await?;
        Ok(axum::Json(JobResponse::from(job)))
    })
    .await
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/sources",
    responses(
        (status = 200, description = "Circuit and quota state per source", body = SourceListResponse),
        (status = 400, description = "Invalid x-user-id header", body = ErrorResponse),
    ),
    tag = "sources"
)]
pub async fn list_sources(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<axum::Json<SourceListResponse>, ApiError> {
    let user = user_id(&headers)?;
    let overview = state.aggregator.source_overview(user.as_deref()).await;
    Ok(axum::Json(SourceListResponse {
        sources: overview.into_iter().map(SourceResponse::from).collect(),
    }))
}

// ---------------------------------------------------------------------------
// Matches
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/matches",
    request_body = MatchRequestBody,
    responses(
        (status = 200, description = "Ranked matches", body = MatchResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 503, description = "Every strategy failed", body = ErrorResponse),
    ),
    tag = "matches"
)]
pub async fn get_matches(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<MatchRequestBody>,
) -> impl IntoResponse {
    let user = user_id(&headers);
    traced(state.tracer.clone(), "http.get_matches", &headers, |ctx| async move {
        let user = user?;
        let mut query = JobSearchQuery::new(body.keywords);
        if let Some(location) = body.location.filter(|l| !l.trim().is_empty()) {
            query = query.with_location(location);
        }
        if let Some(limit) = body.limit {
            query = query.with_page(1, limit);
        }
        let request = MatchRequest {
            profile_keywords: body.profile_keywords,
            query,
            user_id: user,
        };

        let result = state.matcher.get_job_matches(&request, Some(&ctx)).await?;
        Ok(axum::Json(MatchResponse {
            degraded: result.strategy != "primary",
            strategy: result.strategy,
            matches: result
                .matches
                .into_iter()
                .map(JobMatchResponse::from)
                .collect(),
        }))
    })
    .await
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/services",
    params(ServiceFilter),
    responses(
        (status = 200, description = "Registered services", body = ServiceListResponse),
    ),
    tag = "services"
)]
pub async fn list_services(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ServiceFilter>,
) -> impl IntoResponse {
    let mut services = match (&filter.capability, &filter.name) {
        (Some(capability), _) => state.registry.get_services_by_capability(capability),
        (None, Some(name)) => state.registry.get_services_by_name(name),
        (None, None) => state.registry.get_services(),
    };
    if let (Some(_), Some(name)) = (&filter.capability, &filter.name) {
        services.retain(|s| &s.name == name);
    }

    axum::Json(ServiceListResponse {
        total: services.len(),
        services: services.into_iter().map(ServiceResponse::from).collect(),
    })
}

#[utoipa::path(
    get,
    path = "/v1/services/metrics",
    responses(
        (status = 200, description = "Registry totals", body = ServiceMetricsResponse),
    ),
    tag = "services"
)]
pub async fn service_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(ServiceMetricsResponse::from(
        state.registry.get_service_metrics(),
    ))
}

#[utoipa::path(
    get,
    path = "/v1/services/{id}",
    params(("id" = Uuid, Path, description = "Service ID")),
    responses(
        (status = 200, description = "Service", body = ServiceResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
    ),
    tag = "services"
)]
pub async fn get_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state
        .registry
        .get_service(id)
        .ok_or_else(|| AppError::ServiceNotFound(id.to_string()))?;
    Ok(axum::Json(ServiceResponse::from(service)))
}

#[utoipa::path(
    post,
    path = "/v1/services",
    request_body = RegisterServiceRequest,
    responses(
        (status = 201, description = "Service registered", body = ServiceResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Admin endpoints disabled"),
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub async fn register_service(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<RegisterServiceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.registry.register_service(body.into_new_service()?);
    Ok((StatusCode::CREATED, axum::Json(ServiceResponse::from(service))))
}

#[utoipa::path(
    put,
    path = "/v1/services/{id}/status",
    params(("id" = Uuid, Path, description = "Service ID")),
    request_body = UpdateStatusRequest,
    responses(
        (status = 200, description = "Updated service", body = ServiceResponse),
        (status = 400, description = "Unknown status", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Admin endpoints disabled"),
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub async fn update_service_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    axum::Json(body): axum::Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = parse_status(&body.status)?;
    state
        .registry
        .update_service_status(id, status, body.response_time_ms)?;
    let service = state
        .registry
        .get_service(id)
        .ok_or_else(|| AppError::ServiceNotFound(id.to_string()))?;
    Ok(axum::Json(ServiceResponse::from(service)))
}

#[utoipa::path(
    delete,
    path = "/v1/services/{id}",
    params(("id" = Uuid, Path, description = "Service ID")),
    responses(
        (status = 204, description = "Service removed"),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Admin endpoints disabled"),
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub async fn deregister_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if state.registry.deregister_service(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::ServiceNotFound(id.to_string()).into())
    }
}

// ---------------------------------------------------------------------------
// Traces
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/traces/{trace_id}",
    params(("trace_id" = String, Path, description = "32-hex trace id")),
    responses(
        (status = 200, description = "Buffered spans of the trace", body = TraceResponse),
        (status = 404, description = "No spans buffered for this trace", body = ErrorResponse),
    ),
    tag = "traces"
)]
pub async fn get_trace(
    State(state): State<Arc<AppState>>,
    Path(trace_id): Path<String>,
) -> impl IntoResponse {
    let trace_id = trace_id.to_ascii_lowercase();
    let spans = state.tracer.spans_for_trace(&trace_id);
    if spans.is_empty() {
        let body = ErrorResponse {
            error: "not_found".to_string(),
            message: format!("No spans buffered for trace {trace_id}"),
        };
        return (StatusCode::NOT_FOUND, axum::Json(body)).into_response();
    }

    axum::Json(TraceResponse {
        trace_id,
        spans: spans.into_iter().map(SpanResponse::from).collect(),
    })
    .into_response()
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service health", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let circuits = state.aggregator.circuit_stats();
    let degraded = circuits.iter().any(|c| c.state != CircuitState::Closed);

    axum::Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sources: circuits
            .into_iter()
            .map(|c| SourceHealth {
                circuit: c.state.as_str().to_string(),
                source: c.name,
            })
            .collect(),
    })
}
