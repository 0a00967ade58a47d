//! Mode setup collaborators
//!
//! Entering a mode asks the hardware-facing services to reconfigure. The state
//! machine only knows the [`ModeSetup`] seam; the default implementation talks
//! to collaborators by publishing commands on the bus.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::events::{EventBus, Payload, topics};
use crate::gateway::{self, SchemaGateway};

use super::types::Mode;

/// Source recorded for events published by mode handling
pub const MODE_SOURCE: &str = "mode_state_machine";

/// Why mode setup did not finish
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    #[error("timeout")]
    Timeout,

    #[error("{collaborator}: {message}")]
    Collaborator { collaborator: String, message: String },
}

impl SetupError {
    pub fn collaborator(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }
}

/// Performs the side effects of entering a mode
#[async_trait]
pub trait ModeSetup: Send + Sync {
    async fn prepare(&self, from: Mode, to: Mode) -> Result<(), SetupError>;
}

/// Default setup: LED behaviour plus voice start/stop through the gateway
pub struct CollaboratorSetup {
    bus: Arc<EventBus>,
    gateway: SchemaGateway,
}

impl CollaboratorSetup {
    pub fn new(bus: Arc<EventBus>, gateway: SchemaGateway) -> Self {
        Self { bus, gateway }
    }
}

#[async_trait]
impl ModeSetup for CollaboratorSetup {
    async fn prepare(&self, from: Mode, to: Mode) -> Result<(), SetupError> {
        debug!(%from, %to, "CollaboratorSetup::prepare: called");

        let mut led = Payload::new();
        led.insert("behavior".to_string(), json!(to.led_behavior()));
        led.insert("mode".to_string(), json!(to));
        self.bus.publish_from(topics::LED_COMMAND, MODE_SOURCE, led).await;

        let action = if to == Mode::Interactive { "start" } else { "stop" };
        let mut voice = Payload::new();
        voice.insert("action".to_string(), json!(action));
        voice.insert("source".to_string(), json!(MODE_SOURCE));
        gateway::submit(&self.gateway, &self.bus, "voice", &voice)
            .await
            .map_err(|e| SetupError::collaborator("voice", e.to_string()))?;
        Ok(())
    }
}
