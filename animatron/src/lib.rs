//! Animatron - event-driven orchestration core for an animatronic assistant
//!
//! The assistant is a set of services (voice, music, LEDs, a dashboard) that
//! never call each other directly. Everything flows through one event bus:
//! commands come in through a validating gateway, the mode state machine
//! coordinates the services when the operating mode changes, and observers can
//! reconnect and replay what they missed.
//!
//! # Modules
//!
//! - [`events`] - Event bus, replay buffer and event tracing
//! - [`gateway`] - Command validation and normalization
//! - [`mode`] - Operating mode state machine
//! - [`status`] - Service health registry
//! - [`dj`] - Timed music transitions
//! - [`reactors`] - Handlers that turn commands into actions
//! - [`runtime`] - Assembles everything from configuration
//! - [`ipc`] - Control socket for the dashboard bridge and the CLI
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod dj;
pub mod events;
pub mod gateway;
pub mod ipc;
pub mod mode;
pub mod reactors;
pub mod runtime;
pub mod status;

// Re-export commonly used types
pub use config::Config;
pub use dj::{DjScheduler, DjStatus};
pub use events::{
    Attachment, BusStats, Event, EventBus, EventHandler, Payload, ReplayGap, Topic, handler_fn, spawn_event_tracer,
    topics,
};
pub use gateway::{CanonicalEvent, Command, CommandType, FieldError, SchemaGateway, ValidationError};
pub use ipc::{AssistantClient, IpcServer, Request, Response};
pub use mode::{Mode, ModeSetup, ModeStateMachine, SetupError, Transition, TransitionRejected, TransitionStatus};
pub use runtime::{Assistant, AssistantStatus};
pub use status::{ServiceStatus, ServiceStatusRegistry, StatusAggregator};
