use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Quarry API",
        version = "0.1.0",
        description = "Resilient job search across multiple listing providers."
    ),
    paths(
        crate::routes::search_jobs,
        crate::routes::get_job_details,
        crate::routes::list_sources,
        crate::routes::get_matches,
        crate::routes::list_services,
        crate::routes::service_metrics,
        crate::routes::get_service,
        crate::routes::register_service,
        crate::routes::update_service_status,
        crate::routes::deregister_service,
        crate::routes::get_trace,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::SalaryResponse,
        crate::dto::JobResponse,
        crate::dto::SourceReportResponse,
        crate::dto::SearchResponse,
        crate::dto::CircuitResponse,
        crate::dto::RemainingResponse,
        crate::dto::SourceResponse,
        crate::dto::SourceListResponse,
        crate::dto::MatchRequestBody,
        crate::dto::JobMatchResponse,
        crate::dto::MatchResponse,
        crate::dto::RegisterServiceRequest,
        crate::dto::UpdateStatusRequest,
        crate::dto::ServiceResponse,
        crate::dto::ServiceListResponse,
        crate::dto::ServiceMetricsResponse,
        crate::dto::SpanResponse,
        crate::dto::TraceResponse,
        crate::dto::SourceHealth,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "jobs", description = "Aggregated job search"),
        (name = "sources", description = "Per-source circuit and quota state"),
        (name = "matches", description = "Profile matching with fallbacks"),
        (name = "services", description = "Internal service registry"),
        (name = "traces", description = "Recently finished spans"),
        (name = "system", description = "Health and system status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI document.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "Registry admin token. Set via QUARRY_ADMIN_TOKEN environment variable.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
