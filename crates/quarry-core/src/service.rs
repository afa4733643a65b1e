//! Capability-based calls to internal services.
//!
//! A call picks the best healthy service for the capability whose breaker is
//! not open, runs the invocation under that service's breaker and a timeout,
//! propagates the trace context in headers, and reports the observed
//! response time back to the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
use crate::error::AppError;
use crate::registry::{ServiceDescriptor, ServiceRegistry, ServiceStatus};
use crate::trace::{SpanContext, Tracer, inject_headers};
use crate::traits::ServiceInvoker;

#[derive(Clone)]
pub struct ServiceCaller {
    registry: ServiceRegistry,
    invoker: Arc<dyn ServiceInvoker>,
    tracer: Tracer,
    breaker_config: CircuitBreakerConfig,
    call_timeout: Duration,
    breakers: Arc<Mutex<HashMap<Uuid, CircuitBreaker>>>,
}

impl ServiceCaller {
    pub fn new(
        registry: ServiceRegistry,
        invoker: Arc<dyn ServiceInvoker>,
        tracer: Tracer,
    ) -> Self {
        Self {
            registry,
            invoker,
            tracer,
            breaker_config: CircuitBreakerConfig::default(),
            call_timeout: Duration::from_secs(5),
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    fn lock_breakers(&self) -> MutexGuard<'_, HashMap<Uuid, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn breaker_for(&self, service: &ServiceDescriptor) -> CircuitBreaker {
        self.lock_breakers()
            .entry(service.id)
            .or_insert_with(|| {
                CircuitBreaker::new(
                    format!("service:{}", service.name),
                    self.breaker_config.clone(),
                )
            })
            .clone()
    }

    /// Forget the breakers of services that have left the registry.
    fn prune_breakers(&self) {
        self.lock_breakers()
            .retain(|id, _| self.registry.get_service(*id).is_some());
    }

    pub fn circuit_stats(&self) -> Vec<CircuitBreakerStats> {
        self.prune_breakers();
        let breakers = self.lock_breakers();
        let mut stats: Vec<_> = breakers.values().map(CircuitBreaker::stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Invoke `operation` on the best available service offering `capability`.
    pub async fn call(
        &self,
        capability: &str,
        operation: &str,
        payload: &serde_json::Value,
        parent: Option<&SpanContext>,
    ) -> Result<serde_json::Value, AppError> {
        self.prune_breakers();
        let candidates = self.registry.ranked_services(capability);
        if candidates.is_empty() {
            return Err(AppError::ServiceNotFound(format!(
                "no healthy service offers '{capability}'"
            )));
        }

        // Prefer a service whose breaker would admit the call; if every breaker
        // is open, the best-ranked one produces the rejection.
        let (service, breaker) = candidates
            .iter()
            .map(|s| (s, self.breaker_for(s)))
            .find(|(_, b)| b.state() != CircuitState::Open)
            .unwrap_or_else(|| (&candidates[0], self.breaker_for(&candidates[0])));

        let span_name = format!("{}.{}", service.name, operation);
        self.tracer
            .trace_async_operation(&span_name, parent, |ctx| async move {
                let mut headers = HashMap::new();
                inject_headers(&ctx, &mut headers);

                let started = Instant::now();
                let timeout = self.call_timeout;
                let result = breaker
                    .call(|| async {
                        match tokio::time::timeout(
                            timeout,
                            self.invoker.invoke(service, operation, payload, &headers),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(AppError::Timeout(timeout)),
                        }
                    })
                    .await
                    .map_err(AppError::from);

                match &result {
                    Ok(_) => {
                        let elapsed_ms = started.elapsed().as_millis() as u64;
                        if let Err(e) = self.registry.update_service_status(
                            service.id,
                            ServiceStatus::Healthy,
                            Some(elapsed_ms),
                        ) {
                            // Deregistered while the call was in flight.
                            tracing::debug!(
                                service = %service.name,
                                error = %e,
                                "Skipping status update"
                            );
                        }
                    }
                    Err(e) => tracing::warn!(
                        service = %service.name,
                        operation,
                        kind = e.kind(),
                        error = %e,
                        "Service call failed"
                    ),
                }
                result
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::registry::NewService;
    use crate::testutil::MockInvoker;
    use crate::trace::{SpanOptions, extract_span_context};

    fn registry_with(names: &[&str]) -> (ServiceRegistry, Vec<ServiceDescriptor>) {
        let registry = ServiceRegistry::new();
        let services = names
            .iter()
            .map(|name| {
                registry.register_service(
                    NewService::new(*name, format!("http://{name}"), "1.0")
                        .with_capability("job-matching")
                        .with_status(ServiceStatus::Healthy),
                )
            })
            .collect();
        (registry, services)
    }

    /// Breakers open on the first failure and stay open for a minute.
    fn tripping_caller(registry: ServiceRegistry, invoker: MockInvoker) -> ServiceCaller {
        ServiceCaller::new(registry, Arc::new(invoker), Tracer::new("quarry")).with_breaker_config(
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn no_healthy_service_is_not_found() {
        let caller = ServiceCaller::new(
            ServiceRegistry::new(),
            Arc::new(MockInvoker::new()),
            Tracer::new("quarry"),
        );
        let err = caller
            .call("job-matching", "match", &json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ServiceNotFound(_)));
    }

    #[tokio::test]
    async fn success_records_response_time_and_propagates_trace() {
        let (registry, services) = registry_with(&["ml-a"]);
        let invoker = MockInvoker::new();
        invoker.respond("ml-a", Ok(json!({"matches": []})));
        let tracer = Tracer::new("quarry");
        let caller =
            ServiceCaller::new(registry.clone(), Arc::new(invoker.clone()), tracer.clone());

        let root = tracer.create_span(SpanOptions::new("http.request"));
        let value = caller
            .call("job-matching", "match", &json!({"k": 1}), Some(&root.context()))
            .await
            .unwrap();
        assert_eq!(value, json!({"matches": []}));

        let calls = invoker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].operation, "match");
        let propagated = extract_span_context(&calls[0].headers).unwrap();
        assert_eq!(propagated.trace_id, root.trace_id);

        let stored = registry.get_service(services[0].id).unwrap();
        assert!(stored.response_time_ms.is_some());

        let spans = tracer.spans_for_trace(&root.trace_id);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].operation, "ml-a.match");
    }

    #[tokio::test]
    async fn open_breaker_routes_to_next_candidate() {
        let (registry, _) = registry_with(&["ml-a", "ml-b"]);
        let invoker = MockInvoker::new();
        invoker.respond("ml-a", Err(AppError::NetworkError("down".into())));
        invoker.respond("ml-b", Ok(json!("from b")));

        let caller = tripping_caller(registry, invoker.clone());

        let first = caller.call("job-matching", "match", &json!({}), None).await;
        assert!(matches!(first, Err(AppError::NetworkError(_))));

        let second = caller
            .call("job-matching", "match", &json!({}), None)
            .await
            .unwrap();
        assert_eq!(second, json!("from b"));

        let called: Vec<_> = invoker.calls().into_iter().map(|c| c.service).collect();
        assert_eq!(called, vec!["ml-a", "ml-b"]);
    }

    #[tokio::test]
    async fn all_breakers_open_reports_circuit_open() {
        let (registry, _) = registry_with(&["ml-a"]);
        let caller = tripping_caller(registry, MockInvoker::new());

        let _ = caller.call("job-matching", "match", &json!({}), None).await;
        let err = caller
            .call("job-matching", "match", &json!({}), None)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::CircuitOpen { .. }));
        assert_eq!(caller.circuit_stats()[0].state, CircuitState::Open);
    }

    #[tokio::test]
    async fn deregistered_service_breaker_is_dropped() {
        let (registry, services) = registry_with(&["ml-a", "ml-b"]);
        let invoker = MockInvoker::new();
        invoker.respond("ml-a", Err(AppError::NetworkError("down".into())));
        let caller = tripping_caller(registry.clone(), invoker);

        let _ = caller.call("job-matching", "match", &json!({}), None).await;
        assert_eq!(caller.circuit_stats().len(), 1);

        assert!(registry.deregister_service(services[0].id));
        assert!(caller.circuit_stats().is_empty());

        let _ = caller.call("job-matching", "match", &json!({}), None).await;
        let names: Vec<_> = caller.circuit_stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["service:ml-b"]);
    }
}
