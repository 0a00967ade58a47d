//! Event types for the orchestration bus
//!
//! Every observable change in the assistant is an [`Event`] published on a
//! [`Topic`]. Payloads are free-form JSON objects whose shape depends on the topic.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event payload: a JSON object keyed by field name
pub type Payload = Map<String, Value>;

/// Well-known topic names
pub mod topics {
    pub const VOICE_COMMAND: &str = "voice_command";
    pub const MUSIC_COMMAND: &str = "music_command";
    pub const DJ_COMMAND: &str = "dj_command";
    pub const SYSTEM_COMMAND: &str = "system_command";
    pub const LED_COMMAND: &str = "led_command";

    pub const VOICE_STATUS: &str = "voice_status";
    pub const TRANSCRIPTION_UPDATE: &str = "transcription_update";
    pub const MUSIC_STATUS: &str = "music_status";
    pub const DJ_STATUS: &str = "dj_status";
    pub const SYSTEM_MODE_CHANGE: &str = "system_mode_change";
    pub const MODE_TRANSITION: &str = "mode_transition";
    pub const SERVICE_STATUS: &str = "service_status";
    pub const SYSTEM_STATUS: &str = "system_status";
    pub const LOG_EVENT: &str = "log_event";
    pub const HANDLER_FAULT: &str = "handler_fault";
}

/// Name of an event category. Subscriptions match topics exactly.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&Topic> for Topic {
    fn from(topic: &Topic) -> Self {
        topic.clone()
    }
}

impl PartialEq<str> for Topic {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Topic {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// A published event as stored in the replay buffer and delivered to handlers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,
    pub payload: Payload,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    /// Monotonic per bus, starting at 1
    pub sequence_id: u64,
}

impl Event {
    /// Look up a string field in the payload
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Look up a numeric field in the payload
    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(Value::as_f64)
    }
}

/// Convert a JSON value into a payload
///
/// Objects are used as-is; any other value is wrapped as `{"value": ...}`.
pub fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        Value::Null => Payload::new(),
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
