use std::sync::Arc;

use quarry_core::{JobAggregator, MatchService, ServiceRegistry, Tracer};

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub aggregator: Arc<JobAggregator>,
    pub registry: ServiceRegistry,
    pub matcher: MatchService,
    /// Receives request-level spans; the same buffer serves `/v1/traces`.
    pub tracer: Tracer,
    /// Bearer token for the service-registry write endpoints (None = disabled).
    pub admin_token: Option<String>,
}
