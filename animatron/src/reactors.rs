//! Command reactors
//!
//! Bus subscribers that carry out canonical `system_command` and `dj_command`
//! events. The gateway has already validated every command they see.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dj::DjScheduler;
use crate::events::{Event, EventBus, EventHandler, Payload, topics};
use crate::gateway::{Command, DjCommand, SystemCommand};
use crate::mode::{Mode, ModeStateMachine, TransitionRejected};

/// Source recorded for events published by the reactors
pub const REACTOR_SOURCE: &str = "system";

/// Service named by a `restart` command without one
pub const DEFAULT_RESTART_SERVICE: &str = "assistant";

/// Re-reads configuration and applies what can change at runtime
pub struct ConfigReloader {
    path: Option<PathBuf>,
    dj: Arc<DjScheduler>,
}

impl ConfigReloader {
    pub fn new(path: Option<PathBuf>, dj: Arc<DjScheduler>) -> Self {
        Self { path, dj }
    }

    pub async fn reload(&self) -> Result<Config> {
        debug!(path = ?self.path, "ConfigReloader::reload: called");
        let config = Config::load(self.path.as_ref()).context("Failed to reload configuration")?;
        config.validate().context("Reloaded configuration is invalid")?;
        self.dj.set_transition_duration(config.dj.transition_duration()).await;
        info!(
            transition_duration_secs = config.dj.transition_duration_secs,
            "Configuration reloaded"
        );
        Ok(config)
    }
}

/// Handles `system_command`: mode changes, restarts, config refresh
pub struct SystemCommandReactor {
    machine: Arc<ModeStateMachine>,
    bus: Arc<EventBus>,
    reloader: Arc<ConfigReloader>,
}

impl SystemCommandReactor {
    pub fn new(machine: Arc<ModeStateMachine>, bus: Arc<EventBus>, reloader: Arc<ConfigReloader>) -> Self {
        Self { machine, bus, reloader }
    }

    /// Accepted transitions run on their own task; `system_command` is not held meanwhile
    async fn set_mode(&self, mode: Mode, requested_by: &str) {
        match self.machine.spawn_transition(mode) {
            Ok(_) => debug!(%mode, %requested_by, "SystemCommandReactor::set_mode: transition accepted"),
            Err(rejected) => {
                warn!(%mode, code = rejected.code(), "Mode change rejected: {}", rejected);
                self.publish_rejection(mode, requested_by, &rejected).await;
            }
        }
    }

    async fn publish_rejection(&self, mode: Mode, requested_by: &str, rejected: &TransitionRejected) {
        let mut payload = Payload::new();
        payload.insert("level".to_string(), json!("warn"));
        payload.insert("message".to_string(), json!(format!("mode change rejected: {}", rejected.reason())));
        payload.insert("code".to_string(), json!(rejected.code()));
        payload.insert("requested_mode".to_string(), json!(mode));
        payload.insert("requested_by".to_string(), json!(requested_by));
        self.bus.publish_from(topics::LOG_EVENT, REACTOR_SOURCE, payload).await;
    }

    async fn restart(&self, service: Option<String>, requested_by: &str) {
        let service = service.unwrap_or_else(|| DEFAULT_RESTART_SERVICE.to_string());
        info!(%service, %requested_by, "Restart requested");
        let mut payload = Payload::new();
        payload.insert("service_name".to_string(), json!(service));
        payload.insert("state".to_string(), json!("restarting"));
        payload.insert("detail".to_string(), json!({"requested_by": requested_by}));
        self.bus
            .publish_from(topics::SERVICE_STATUS, REACTOR_SOURCE, payload)
            .await;
    }
}

#[async_trait]
impl EventHandler for SystemCommandReactor {
    async fn handle(&self, event: &Event) -> Result<()> {
        let requested_by = event.str_field("source").unwrap_or(event.source.as_str());
        let command = Command::from_event(event)?;
        debug!(action = command.action(), %requested_by, "SystemCommandReactor::handle: called");

        match command {
            Command::System(SystemCommand::SetMode { mode }) => self.set_mode(mode, requested_by).await,
            Command::System(SystemCommand::Restart { service }) => self.restart(service, requested_by).await,
            Command::System(SystemCommand::RefreshConfig) => {
                self.reloader.reload().await?;
            }
            other => return Err(eyre::eyre!("unexpected command on system_command: {:?}", other)),
        }
        Ok(())
    }
}

/// Handles `dj_command` by driving the scheduler
pub struct DjCommandReactor {
    dj: Arc<DjScheduler>,
}

impl DjCommandReactor {
    pub fn new(dj: Arc<DjScheduler>) -> Self {
        Self { dj }
    }
}

#[async_trait]
impl EventHandler for DjCommandReactor {
    async fn handle(&self, event: &Event) -> Result<()> {
        let command = Command::from_event(event)?;
        debug!(action = command.action(), "DjCommandReactor::handle: called");

        match command {
            Command::Dj(DjCommand::Start) => {
                if !self.dj.start().await {
                    debug!("DjCommandReactor::handle: already active");
                }
            }
            Command::Dj(DjCommand::Stop) => {
                if !self.dj.stop().await {
                    debug!("DjCommandReactor::handle: not active");
                }
            }
            Command::Dj(DjCommand::Next) => {
                self.dj.skip().await?;
            }
            Command::Dj(DjCommand::UpdateSettings { transition_duration }) => {
                if let Some(secs) = transition_duration {
                    self.dj.set_transition_duration(Duration::from_secs_f64(secs)).await;
                }
            }
            other => return Err(eyre::eyre!("unexpected command on dj_command: {:?}", other)),
        }
        Ok(())
    }
}
