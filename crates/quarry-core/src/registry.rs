//! In-process registry of internal computation services.
//!
//! Services are discovered by capability ("job-matching", "document-generation",
//! ...) and selected by load: among healthy candidates, the one with the lowest
//! `response_time_ms / weight` wins.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "healthy" => Ok(ServiceStatus::Healthy),
            "unhealthy" => Ok(ServiceStatus::Unhealthy),
            "unknown" => Ok(ServiceStatus::Unknown),
            _ => Err(format!("Unknown service status: {}", s)),
        }
    }
}

/// A registered service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub version: String,
    pub status: ServiceStatus,
    pub capabilities: BTreeSet<String>,
    /// Last observed response time.
    pub response_time_ms: Option<u64>,
    /// Relative capacity, at least 1.
    pub weight: u32,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceDescriptor {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ServiceStatus::Healthy
    }

    /// Response time scaled by weight; `None` until a response time is known.
    pub fn load_score(&self) -> Option<f64> {
        self.response_time_ms
            .map(|ms| ms as f64 / f64::from(self.weight.max(1)))
    }
}

/// Registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewService {
    pub name: String,
    pub address: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub status: Option<ServiceStatus>,
}

impl NewService {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            version: version.into(),
            capabilities: Vec::new(),
            weight: None,
            status: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Aggregate view of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceMetrics {
    pub total_services: usize,
    pub healthy_services: usize,
    pub services_by_capability: BTreeMap<String, usize>,
}

/// Thread-safe registry, shared by handle.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<RwLock<HashMap<Uuid, ServiceDescriptor>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, ServiceDescriptor>> {
        self.services.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned service registry lock");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, ServiceDescriptor>> {
        self.services.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned service registry lock");
            poisoned.into_inner()
        })
    }

    pub fn register_service(&self, service: NewService) -> ServiceDescriptor {
        let now = Utc::now();
        let descriptor = ServiceDescriptor {
            id: Uuid::new_v4(),
            name: service.name.trim().to_string(),
            address: service.address.trim_end_matches('/').to_string(),
            version: service.version,
            status: service.status.unwrap_or_default(),
            capabilities: service.capabilities.into_iter().collect(),
            response_time_ms: None,
            weight: service.weight.unwrap_or(1).max(1),
            registered_at: now,
            updated_at: now,
        };

        tracing::info!(
            service_id = %descriptor.id,
            name = %descriptor.name,
            address = %descriptor.address,
            capabilities = ?descriptor.capabilities,
            "Service registered"
        );

        self.write().insert(descriptor.id, descriptor.clone());
        descriptor
    }

    pub fn get_service(&self, id: Uuid) -> Option<ServiceDescriptor> {
        self.read().get(&id).cloned()
    }

    /// All services, ordered by name.
    pub fn get_services(&self) -> Vec<ServiceDescriptor> {
        self.collect_sorted(|_| true)
    }

    pub fn get_services_by_capability(&self, capability: &str) -> Vec<ServiceDescriptor> {
        self.collect_sorted(|s| s.has_capability(capability))
    }

    pub fn get_services_by_name(&self, name: &str) -> Vec<ServiceDescriptor> {
        self.collect_sorted(|s| s.name == name)
    }

    fn collect_sorted(&self, keep: impl Fn(&ServiceDescriptor) -> bool) -> Vec<ServiceDescriptor> {
        let mut services: Vec<_> = self.read().values().filter(|s| keep(s)).cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        services
    }

    /// Overwrite status and, when given, the observed response time.
    /// Applying the same update twice is a no-op apart from `updated_at`.
    pub fn update_service_status(
        &self,
        id: Uuid,
        status: ServiceStatus,
        response_time_ms: Option<u64>,
    ) -> Result<(), AppError> {
        let mut services = self.write();
        let service = services
            .get_mut(&id)
            .ok_or_else(|| AppError::ServiceNotFound(id.to_string()))?;

        if service.status != status {
            tracing::info!(
                service_id = %id,
                name = %service.name,
                from = %service.status,
                to = %status,
                "Service status changed"
            );
        }
        service.status = status;
        if response_time_ms.is_some() {
            service.response_time_ms = response_time_ms;
        }
        service.updated_at = Utc::now();
        Ok(())
    }

    /// Returns whether a service was removed.
    pub fn deregister_service(&self, id: Uuid) -> bool {
        let removed = self.write().remove(&id);
        if let Some(service) = &removed {
            tracing::info!(service_id = %id, name = %service.name, "Service deregistered");
        }
        removed.is_some()
    }

    pub fn get_service_metrics(&self) -> ServiceMetrics {
        let services = self.read();
        let mut services_by_capability = BTreeMap::new();
        for capability in services.values().flat_map(|s| s.capabilities.iter()) {
            *services_by_capability.entry(capability.clone()).or_insert(0) += 1;
        }
        ServiceMetrics {
            total_services: services.len(),
            healthy_services: services.values().filter(|s| s.is_healthy()).count(),
            services_by_capability,
        }
    }

    /// The least-loaded healthy service offering `capability`.
    ///
    /// Services with a measured response time rank ahead of unmeasured ones;
    /// ties break by name.
    pub fn select_service(&self, capability: &str) -> Option<ServiceDescriptor> {
        self.read()
            .values()
            .filter(|s| s.is_healthy() && s.has_capability(capability))
            .min_by(|a, b| compare_load(a, b))
            .cloned()
    }

    /// Healthy services offering `capability`, best candidate first.
    pub fn ranked_services(&self, capability: &str) -> Vec<ServiceDescriptor> {
        let mut services: Vec<_> = self
            .read()
            .values()
            .filter(|s| s.is_healthy() && s.has_capability(capability))
            .cloned()
            .collect();
        services.sort_by(compare_load);
        services
    }
}

fn compare_load(a: &ServiceDescriptor, b: &ServiceDescriptor) -> Ordering {
    let by_score = match (a.load_score(), b.load_score()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_score.then_with(|| a.name.cmp(&b.name)).then_with(|| a.id.cmp(&b.id))
}
