pub mod aggregator;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod degradation;
pub mod error;
pub mod matching;
pub mod models;
pub mod normalize;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod service;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
pub mod trace;
pub mod traits;

pub use aggregator::{
    AggregatorConfig, JobAggregator, SearchContext, SearchOutcome, SourceOverview, SourceReport,
    SourceStatus, merge_results,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerStats, CircuitState,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QuarryConfig;
pub use degradation::{
    Degraded, DegradationCoordinator, FallbackStrategy, FeatureFlags, OperationStats,
    StaticFeatureFlags,
};
pub use error::AppError;
pub use matching::{JobMatch, MatchRequest, MatchResult, MatchService};
pub use models::{
    EmploymentType, Job, JobFilters, JobSearchQuery, JobSource, RemoteType, SalaryRange,
    compute_hash,
};
pub use rate_limit::{
    CounterStore, MemoryCounterStore, ProviderLimits, RateLimitConfig, RateLimiter, Remaining,
    ScopeKey, WindowLimit, WindowLimits, WindowUsage,
};
pub use registry::{NewService, ServiceDescriptor, ServiceMetrics, ServiceRegistry, ServiceStatus};
pub use retry::RetryPolicy;
pub use service::ServiceCaller;
pub use trace::{Span, SpanContext, SpanOptions, Tracer, extract_span_context, inject_headers};
pub use traits::{ServiceInvoker, SourceAdapter};
