use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::Response;
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;

use quarry_core::models::JobSource;
use quarry_core::testutil::{MockAdapter, MockInvoker, sample_job};
use quarry_core::{
    AggregatorConfig, CircuitBreakerConfig, DegradationCoordinator, JobAggregator, MatchService,
    RateLimitConfig, RateLimiter, RetryPolicy, ServiceCaller, ServiceRegistry, StaticFeatureFlags,
    Tracer,
};
use quarry_server::routes;
use quarry_server::state::AppState;

pub const TEST_ADMIN_TOKEN: &str = "test-admin-token";

/// Router plus the doubles behind it, so tests can script and inspect them.
pub struct TestApp {
    pub router: Router,
    pub registry: ServiceRegistry,
    pub invoker: MockInvoker,
    pub tracer: Tracer,
}

pub struct Options {
    pub admin_token: Option<String>,
    pub adapters: Vec<MockAdapter>,
    pub rate_limits: RateLimitConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            admin_token: Some(TEST_ADMIN_TOKEN.to_string()),
            adapters: default_adapters(),
            rate_limits: RateLimitConfig::default(),
        }
    }
}

/// Two healthy sources with one overlapping listing each.
pub fn default_adapters() -> Vec<MockAdapter> {
    let day = |d| Utc.with_ymd_and_hms(2024, 6, d, 12, 0, 0).unwrap();
    vec![
        MockAdapter::new(JobSource::RemoteOk).with_jobs(vec![
            sample_job(JobSource::RemoteOk, "r1", "Rust Engineer", "Ferrous", day(3)),
            sample_job(JobSource::RemoteOk, "r2", "Go Developer", "Gopher Co", day(1)),
        ]),
        MockAdapter::new(JobSource::Adzuna).with_jobs(vec![
            sample_job(JobSource::Adzuna, "a1", "Senior Rust Engineer", "Crab Labs", day(2)),
        ]),
    ]
}

pub fn setup_test_app() -> TestApp {
    setup_with(Options::default())
}

pub fn setup_test_app_no_auth() -> TestApp {
    setup_with(Options {
        admin_token: None,
        ..Options::default()
    })
}

pub fn setup_with(options: Options) -> TestApp {
    let tracer = Tracer::new("quarry-server-test");
    let config = AggregatorConfig {
        call_timeout: Duration::from_secs(2),
        retry: RetryPolicy::none(),
        breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        },
        cache_ttl: None,
        cache_capacity: 100,
    };
    let limiter = Arc::new(RateLimiter::new(options.rate_limits));

    let aggregator = options.adapters.into_iter().fold(
        JobAggregator::new(config, limiter, tracer.clone()),
        |agg, adapter| agg.with_adapter(Arc::new(adapter)),
    );
    let aggregator = Arc::new(aggregator);

    let registry = ServiceRegistry::new();
    let invoker = MockInvoker::new();
    let caller = ServiceCaller::new(registry.clone(), Arc::new(invoker.clone()), tracer.clone())
        .with_timeout(Duration::from_secs(1));
    let matcher = MatchService::new(
        caller,
        aggregator.clone(),
        DegradationCoordinator::new(Arc::new(StaticFeatureFlags::new())),
    );

    let state = Arc::new(AppState {
        aggregator,
        registry: registry.clone(),
        matcher,
        tracer: tracer.clone(),
        admin_token: options.admin_token,
    });

    TestApp {
        router: routes::router(state),
        registry,
        invoker,
        tracer,
    }
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}
