//! Command gateway
//!
//! The single entry point for commands from untrusted sources (dashboard,
//! CLI, the DJ scheduler). Raw commands are validated against a closed
//! per-type schema and, if valid, published on the bus as canonical events.
//! Invalid commands are never published.

mod command;
mod error;
mod schema;

pub use command::{Command, CommandType, DjCommand, MusicCommand, SystemCommand, VoiceCommand};
pub use error::{FieldError, ValidationError};
pub use schema::{CanonicalEvent, DEFAULT_SOURCE, MAX_TRANSITION_SECS, MIN_TRANSITION_SECS, SchemaGateway};

use serde_json::Value;
use tracing::{debug, info};

use crate::events::{EventBus, Payload};

/// Validate a command and publish it; returns the sequence id on success
pub async fn submit(
    gateway: &SchemaGateway,
    bus: &EventBus,
    command_type: &str,
    raw: &Payload,
) -> Result<u64, ValidationError> {
    debug!(%command_type, "submit: called");
    let canonical = match gateway.validate(command_type, raw) {
        Ok(canonical) => canonical,
        Err(e) => {
            info!(error = %e, "Rejected command");
            return Err(e);
        }
    };
    Ok(publish(bus, canonical).await)
}

/// Validate a whole command object (carrying `type`) and publish it
pub async fn submit_value(gateway: &SchemaGateway, bus: &EventBus, raw: &Value) -> Result<u64, ValidationError> {
    debug!("submit_value: called");
    let canonical = match gateway.validate_value(raw) {
        Ok(canonical) => canonical,
        Err(e) => {
            info!(error = %e, "Rejected command");
            return Err(e);
        }
    };
    Ok(publish(bus, canonical).await)
}

async fn publish(bus: &EventBus, canonical: CanonicalEvent) -> u64 {
    let CanonicalEvent {
        topic, payload, source, ..
    } = canonical;
    bus.publish_from(topic, source, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::into_payload;
    use serde_json::json;

    #[tokio::test]
    async fn test_submit_publishes_canonical_event() {
        let bus = EventBus::default();
        let gateway = SchemaGateway::default();

        let seq = submit(
            &gateway,
            &bus,
            "music",
            &into_payload(json!({"action": "volume", "volume_level": 0.8})),
        )
        .await
        .unwrap();

        let events = bus.snapshot(None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence_id, seq);
        assert_eq!(events[0].topic, "music_command");
        assert_eq!(events[0].source, "dashboard");
        assert_eq!(events[0].f64_field("volume"), Some(0.8));
        assert!(!events[0].payload.contains_key("volume_level"));
    }

    #[tokio::test]
    async fn test_invalid_command_is_not_published() {
        let bus = EventBus::default();
        let gateway = SchemaGateway::default();

        let err = submit(
            &gateway,
            &bus,
            "music",
            &into_payload(json!({"action": "volume", "volume_level": 7})),
        )
        .await
        .unwrap_err();

        assert!(err.has_field("volume_level"));
        assert_eq!(bus.last_sequence_id(), 0);
    }

    #[tokio::test]
    async fn test_submit_value_uses_type_field() {
        let bus = EventBus::default();
        let gateway = SchemaGateway::default();
        submit_value(&gateway, &bus, &json!({"type": "dj", "action": "start", "source": "cli"}))
            .await
            .unwrap();

        let events = bus.snapshot(None).unwrap();
        assert_eq!(events[0].topic, "dj_command");
        assert_eq!(events[0].source, "cli");
    }
}
