//! Service Status Registry
//!
//! Keeps the latest reported status of every subsystem and republishes the
//! aggregate as `system_status` whenever a subsystem reports in.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::eyre;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::events::{Event, EventBus, EventHandler, Payload, SubscriptionId, topics};
use crate::mode::Mode;

/// Source recorded for aggregated status events
pub const REGISTRY_SOURCE: &str = "status_registry";

/// States that make the whole system unhealthy
const UNHEALTHY_STATES: [&str; 2] = ["error", "failed"];

/// Latest status reported by one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service_name: String,
    pub state: String,
    /// Free-form detail supplied by the service
    #[serde(default)]
    pub detail: Value,
    pub timestamp: DateTime<Utc>,
}

impl ServiceStatus {
    pub fn is_unhealthy(&self) -> bool {
        UNHEALTHY_STATES.contains(&self.state.as_str())
    }
}

/// Last-write-wins map of service name to status
#[derive(Debug, Default)]
pub struct ServiceStatusRegistry {
    services: RwLock<BTreeMap<String, ServiceStatus>>,
}

impl ServiceStatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status, replacing any previous one for the same service
    pub fn update(&self, service_name: impl Into<String>, state: impl Into<String>, detail: Value) -> ServiceStatus {
        let status = ServiceStatus {
            service_name: service_name.into(),
            state: state.into(),
            detail,
            timestamp: Utc::now(),
        };
        self.apply(status.clone());
        status
    }

    pub fn apply(&self, status: ServiceStatus) {
        debug!(service = %status.service_name, state = %status.state, "ServiceStatusRegistry::apply: called");
        self.services.write().insert(status.service_name.clone(), status);
    }

    /// Owned copy of every known status
    pub fn snapshot(&self) -> BTreeMap<String, ServiceStatus> {
        self.services.read().clone()
    }

    pub fn get(&self, service_name: &str) -> Option<ServiceStatus> {
        self.services.read().get(service_name).cloned()
    }

    /// False when any service reports an error state
    pub fn is_healthy(&self) -> bool {
        !self.services.read().values().any(ServiceStatus::is_unhealthy)
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

/// Bus handler feeding `service_status` events into the registry
pub struct StatusAggregator {
    registry: Arc<ServiceStatusRegistry>,
    bus: Arc<EventBus>,
    mode: watch::Receiver<Mode>,
}

impl StatusAggregator {
    pub fn new(registry: Arc<ServiceStatusRegistry>, bus: Arc<EventBus>, mode: watch::Receiver<Mode>) -> Self {
        Self { registry, bus, mode }
    }

    /// Subscribe a new aggregator to `service_status`
    pub fn subscribe(
        registry: Arc<ServiceStatusRegistry>,
        bus: &Arc<EventBus>,
        mode: watch::Receiver<Mode>,
    ) -> SubscriptionId {
        let aggregator = Self::new(registry, bus.clone(), mode);
        bus.subscribe(topics::SERVICE_STATUS, Arc::new(aggregator))
    }

    fn parse(event: &Event) -> eyre::Result<ServiceStatus> {
        let service_name = event
            .str_field("service_name")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| eyre!("service_status without service_name"))?;
        let state = event
            .str_field("state")
            .ok_or_else(|| eyre!("service_status for '{}' without state", service_name))?;
        Ok(ServiceStatus {
            service_name: service_name.to_string(),
            state: state.to_string(),
            detail: event.payload.get("detail").cloned().unwrap_or(Value::Null),
            timestamp: event.timestamp,
        })
    }
}

#[async_trait]
impl EventHandler for StatusAggregator {
    async fn handle(&self, event: &Event) -> eyre::Result<()> {
        let status = Self::parse(event)?;
        if status.is_unhealthy() {
            info!(service = %status.service_name, state = %status.state, "Service reported failure");
        }
        self.registry.apply(status);

        let current_mode = *self.mode.borrow();
        let mut payload = Payload::new();
        payload.insert("services".to_string(), json!(self.registry.snapshot()));
        payload.insert("healthy".to_string(), json!(self.registry.is_healthy()));
        payload.insert("current_mode".to_string(), json!(current_mode));
        self.bus
            .publish_from(topics::SYSTEM_STATUS, REGISTRY_SOURCE, payload)
            .await;
        Ok(())
    }
}
