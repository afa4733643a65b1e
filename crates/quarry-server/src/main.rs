use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use quarry_client::HttpServiceInvoker;
use quarry_core::{
    DegradationCoordinator, JobAggregator, MatchService, QuarryConfig, RateLimiter,
    ServiceCaller, ServiceRegistry, StaticFeatureFlags, Tracer,
};
use quarry_db::{Database, DatabaseConfig};
use quarry_server::routes;
use quarry_server::state::AppState;

/// Counters idle this long no longer matter to any window.
const STALE_COUNTER_IDLE: Duration = Duration::from_secs(2 * 86_400);
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("quarry=info".parse()?))
        .with_target(false)
        .init();

    let config = QuarryConfig::from_env()?;
    let port = std::env::var("QUARRY_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");
    let admin_token = std::env::var("QUARRY_ADMIN_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty());
    if admin_token.is_none() {
        tracing::warn!("QUARRY_ADMIN_TOKEN not set; registry write endpoints are disabled");
    }

    let limiter = build_rate_limiter(&config).await?;
    tokio::spawn(purge_stale_counters(limiter.clone()));
    let tracer = Tracer::new("quarry-server");

    let aggregator = quarry_client::default_adapters()?.into_iter().fold(
        JobAggregator::new(config.aggregator.clone(), limiter, tracer.clone()),
        JobAggregator::with_adapter,
    );
    let aggregator = Arc::new(aggregator);

    let registry = ServiceRegistry::new();
    let caller = ServiceCaller::new(
        registry.clone(),
        Arc::new(HttpServiceInvoker::new()?),
        tracer.clone(),
    )
    .with_timeout(config.service_timeout)
    .with_breaker_config(config.aggregator.breaker.clone());
    let coordinator = DegradationCoordinator::new(Arc::new(StaticFeatureFlags::from_env()));
    let matcher = MatchService::new(caller, aggregator.clone(), coordinator);

    let state = Arc::new(AppState {
        aggregator,
        registry,
        matcher,
        tracer,
        admin_token,
    });

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// In-process counters by default; `QUARRY_RATE_LIMIT_STORE=postgres` shares
/// them with every instance pointed at the same database.
async fn build_rate_limiter(config: &QuarryConfig) -> anyhow::Result<Arc<RateLimiter>> {
    let store = std::env::var("QUARRY_RATE_LIMIT_STORE").unwrap_or_else(|_| "memory".into());
    match store.trim().to_lowercase().as_str() {
        "memory" => Ok(Arc::new(RateLimiter::new(config.rate_limits.clone()))),
        "postgres" => {
            let db = Database::connect(&DatabaseConfig::from_env()?).await?;
            db.migrate().await?;
            Ok(Arc::new(RateLimiter::with_store(
                Arc::new(db.counter_store()),
                config.rate_limits.clone(),
            )))
        }
        other => anyhow::bail!("Unknown QUARRY_RATE_LIMIT_STORE '{other}' (memory|postgres)"),
    }
}

async fn purge_stale_counters(limiter: Arc<RateLimiter>) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    loop {
        interval.tick().await;
        match limiter.purge_stale(STALE_COUNTER_IDLE).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Purged stale rate-limit counters"),
            Err(e) => tracing::warn!(error = %e, "Failed to purge rate-limit counters"),
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
