//! Assistant runtime - wires every component together from configuration

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;
use crate::dj::{DjScheduler, DjStatus};
use crate::events::{BusStats, EventBus, spawn_event_tracer, topics};
use crate::gateway::{self, SchemaGateway, ValidationError};
use crate::mode::{CollaboratorSetup, Mode, ModeSetup, ModeStateMachine, Transition};
use crate::reactors::{ConfigReloader, DjCommandReactor, SystemCommandReactor};
use crate::status::{ServiceStatus, ServiceStatusRegistry, StatusAggregator};

/// Answer to a status query
#[derive(Debug, Clone, Serialize)]
pub struct AssistantStatus {
    pub current_mode: Mode,
    pub in_flight: Option<Transition>,
    pub healthy: bool,
    pub services: BTreeMap<String, ServiceStatus>,
    pub dj: DjStatus,
    pub bus: BusStats,
}

/// The assembled orchestration core
pub struct Assistant {
    config: Config,
    bus: Arc<EventBus>,
    gateway: SchemaGateway,
    machine: Arc<ModeStateMachine>,
    registry: Arc<ServiceStatusRegistry>,
    dj: Arc<DjScheduler>,
    reloader: Arc<ConfigReloader>,
    tracer: Mutex<Option<JoinHandle<()>>>,
}

impl Assistant {
    /// Build with the default collaborator setup
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        let bus = Arc::new(EventBus::new(config.bus.replay_capacity, config.bus.observer_capacity));
        let gateway = SchemaGateway::new(config.gateway.default_source.clone());
        let setup = Arc::new(CollaboratorSetup::new(bus.clone(), gateway.clone()));
        Self::assemble(config, config_path, bus, gateway, setup)
    }

    /// Build with a custom mode setup
    pub fn with_setup(config: Config, setup: Arc<dyn ModeSetup>) -> Result<Self> {
        let bus = Arc::new(EventBus::new(config.bus.replay_capacity, config.bus.observer_capacity));
        let gateway = SchemaGateway::new(config.gateway.default_source.clone());
        Self::assemble(config, None, bus, gateway, setup)
    }

    fn assemble(
        config: Config,
        config_path: Option<PathBuf>,
        bus: Arc<EventBus>,
        gateway: SchemaGateway,
        setup: Arc<dyn ModeSetup>,
    ) -> Result<Self> {
        debug!(?config, "Assistant::assemble: called");
        config.validate().context("Invalid configuration")?;

        let machine = Arc::new(ModeStateMachine::new(
            bus.clone(),
            setup,
            config.mode.transition_timeout(),
        ));
        let registry = Arc::new(ServiceStatusRegistry::new());
        let dj = Arc::new(DjScheduler::new(
            bus.clone(),
            gateway.clone(),
            config.dj.transition_duration(),
        ));
        let reloader = Arc::new(ConfigReloader::new(config_path, dj.clone()));

        StatusAggregator::subscribe(registry.clone(), &bus, machine.subscribe_mode());
        bus.subscribe(
            topics::SYSTEM_COMMAND,
            Arc::new(SystemCommandReactor::new(machine.clone(), bus.clone(), reloader.clone())),
        );
        bus.subscribe(topics::DJ_COMMAND, Arc::new(DjCommandReactor::new(dj.clone())));

        info!(
            replay_capacity = config.bus.replay_capacity,
            transition_timeout_ms = config.mode.transition_timeout_ms,
            "Assistant assembled"
        );
        Ok(Self {
            config,
            bus,
            gateway,
            machine,
            registry,
            dj,
            reloader,
            tracer: Mutex::new(None),
        })
    }

    /// Log every bus event through tracing; needs a running tokio runtime
    pub fn enable_tracing(&self) {
        let mut tracer = self.tracer.lock();
        if tracer.is_none() {
            *tracer = Some(spawn_event_tracer(&self.bus));
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn gateway(&self) -> &SchemaGateway {
        &self.gateway
    }

    pub fn mode_machine(&self) -> &Arc<ModeStateMachine> {
        &self.machine
    }

    pub fn registry(&self) -> &Arc<ServiceStatusRegistry> {
        &self.registry
    }

    pub fn dj(&self) -> &Arc<DjScheduler> {
        &self.dj
    }

    /// Validate and publish an untrusted command object
    pub async fn submit(&self, raw: &Value) -> Result<u64, ValidationError> {
        gateway::submit_value(&self.gateway, &self.bus, raw).await
    }

    /// Re-read configuration from disk and apply it
    pub async fn reload_config(&self) -> Result<Config> {
        self.reloader.reload().await
    }

    pub fn status(&self) -> AssistantStatus {
        AssistantStatus {
            current_mode: self.machine.current_mode(),
            in_flight: self.machine.in_flight(),
            healthy: self.registry.is_healthy(),
            services: self.registry.snapshot(),
            dj: self.dj.status(),
            bus: self.bus.stats(),
        }
    }

    /// Stop background activity
    pub async fn shutdown(&self) {
        info!("Assistant shutting down");
        self.dj.stop().await;
        let tracer = self.tracer.lock().take();
        if let Some(tracer) = tracer {
            tracer.abort();
        }
    }
}
