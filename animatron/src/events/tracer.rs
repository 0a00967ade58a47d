//! Event Tracer - mirrors bus traffic into the tracing log
//!
//! The tracer observes the bus like any other live observer and writes each
//! event to the process log. `log_event` payloads are logged at the level they
//! carry, so subsystems can emit telemetry without a logging dependency of their own.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{Level, debug, error, info, trace, warn};

use super::bus::EventBus;
use super::types::{Event, topics};

/// Observer that writes every event to the tracing log
#[derive(Debug, Default)]
pub struct EventTracer {
    /// Events seen per topic
    counts: BTreeMap<String, u64>,
}

impl EventTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log one event, returning the level it was logged at
    pub fn trace_event(&mut self, event: &Event) -> Level {
        *self.counts.entry(event.topic.to_string()).or_default() += 1;

        let level = level_for(event);
        let message = event.str_field("message").unwrap_or("");
        match level {
            Level::ERROR => error!(topic = %event.topic, seq = event.sequence_id, source = %event.source, %message, "event"),
            Level::WARN => warn!(topic = %event.topic, seq = event.sequence_id, source = %event.source, %message, "event"),
            Level::INFO => info!(topic = %event.topic, seq = event.sequence_id, source = %event.source, %message, "event"),
            Level::DEBUG => debug!(topic = %event.topic, seq = event.sequence_id, source = %event.source, "event"),
            _ => trace!(topic = %event.topic, seq = event.sequence_id, source = %event.source, "event"),
        }
        level
    }

    pub fn count(&self, topic: &str) -> u64 {
        self.counts.get(topic).copied().unwrap_or(0)
    }

    /// Run until the bus is dropped
    ///
    /// This is meant to be spawned as a background task.
    pub async fn run(mut self, mut rx: broadcast::Receiver<Event>) {
        debug!("EventTracer::run: starting event tracer");
        loop {
            match rx.recv().await {
                Ok(event) => {
                    self.trace_event(&event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "EventTracer: lagged behind, missed events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("EventTracer: channel closed, shutting down");
                    break;
                }
            }
        }
    }
}

fn level_for(event: &Event) -> Level {
    if event.topic == topics::HANDLER_FAULT {
        return Level::WARN;
    }
    if event.topic == topics::MODE_TRANSITION || event.topic == topics::SYSTEM_MODE_CHANGE {
        return Level::INFO;
    }
    if event.topic != topics::LOG_EVENT {
        return Level::DEBUG;
    }
    match event.str_field("level").map(str::to_ascii_lowercase).as_deref() {
        Some("error") => Level::ERROR,
        Some("warn") | Some("warning") => Level::WARN,
        Some("debug") => Level::DEBUG,
        Some("trace") => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Spawn the event tracer as a background task
pub fn spawn_event_tracer(event_bus: &Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let rx = event_bus.watch();
    tokio::spawn(EventTracer::new().run(rx))
}
