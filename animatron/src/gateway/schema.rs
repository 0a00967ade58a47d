//! Schema Gateway - validates untrusted commands into canonical events

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::debug;

use crate::events::{Payload, Topic};
use crate::mode::Mode;

use super::command::{Command, CommandType, DjCommand, MusicCommand, SystemCommand, VoiceCommand};
use super::error::{FieldError, ValidationError};

/// Source recorded when a command does not name one
pub const DEFAULT_SOURCE: &str = "dashboard";

/// Bounds for `dj.update_settings.transition_duration` (seconds)
pub const MIN_TRANSITION_SECS: f64 = 1.0;
pub const MAX_TRANSITION_SECS: f64 = 3600.0;

/// Fields every command may carry regardless of action
const ENVELOPE_FIELDS: [&str; 3] = ["type", "action", "source"];

/// A validated command ready to be published
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    pub topic: Topic,
    pub payload: Payload,
    pub source: String,
    pub command: Command,
}

/// Validates raw commands against the per-type schemas
///
/// Validation is pure: the same input always yields the same canonical event
/// or the same list of violations, and nothing is published.
#[derive(Debug, Clone)]
pub struct SchemaGateway {
    default_source: String,
}

impl Default for SchemaGateway {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE)
    }
}

impl SchemaGateway {
    pub fn new(default_source: impl Into<String>) -> Self {
        Self {
            default_source: default_source.into(),
        }
    }

    pub fn default_source(&self) -> &str {
        &self.default_source
    }

    /// Validate a whole command object (`{"type": ..., "action": ..., ...}`)
    pub fn validate_value(&self, raw: &Value) -> Result<CanonicalEvent, ValidationError> {
        let Value::Object(fields) = raw else {
            return Err(ValidationError::new(
                "unknown",
                vec![FieldError::new("command", "must be a JSON object")],
            ));
        };
        match fields.get("type") {
            Some(Value::String(command_type)) => self.validate(command_type, fields),
            Some(_) => Err(ValidationError::new(
                "unknown",
                vec![FieldError::new("type", "must be a string")],
            )),
            None => Err(ValidationError::new("unknown", vec![FieldError::new("type", "required")])),
        }
    }

    /// Validate the fields of a command of the given type
    pub fn validate(&self, command_type: &str, raw: &Payload) -> Result<CanonicalEvent, ValidationError> {
        debug!(%command_type, field_count = raw.len(), "SchemaGateway::validate: called");

        let kind = command_type.parse::<CommandType>().map_err(|message| {
            ValidationError::new(command_type, vec![FieldError::new("type", message)])
        })?;

        let mut fields = FieldReader::new(raw);
        let action = match raw.get("action") {
            None => None,
            Some(Value::String(action)) if kind.actions().contains(&action.as_str()) => Some(action.as_str()),
            Some(Value::String(action)) => {
                fields.violation(
                    "action",
                    format!(
                        "unknown action '{}' for {} (expected one of: {})",
                        action,
                        kind,
                        kind.actions().join(", ")
                    ),
                );
                None
            }
            Some(_) => {
                fields.violation("action", "must be a string");
                None
            }
        };
        match raw.get("type") {
            None => {}
            Some(Value::String(named)) if named.parse::<CommandType>().ok() == Some(kind) => {}
            Some(Value::String(named)) => {
                fields.violation("type", format!("'{}' does not match command type {}", named, kind));
            }
            Some(_) => fields.violation("type", "must be a string"),
        }

        let source = fields
            .optional_text("source")
            .unwrap_or_else(|| self.default_source.clone());

        let Some(action) = action else {
            if !raw.contains_key("action") {
                fields.violation("action", "required");
            }
            return Err(ValidationError::new(kind.as_str(), fields.violations));
        };

        let command = match kind {
            CommandType::Voice => Some(Command::Voice(match action {
                "start" => VoiceCommand::Start,
                _ => VoiceCommand::Stop,
            })),
            CommandType::Music => parse_music(action, &mut fields).map(Command::Music),
            CommandType::Dj => parse_dj(action, &mut fields).map(Command::Dj),
            CommandType::System => parse_system(action, &mut fields).map(Command::System),
        };

        fields.reject_unknown();

        match command {
            Some(command) if fields.violations.is_empty() => {
                let payload = command.to_payload(&source);
                debug!(topic = command.topic(), action = command.action(), "SchemaGateway::validate: accepted");
                Ok(CanonicalEvent {
                    topic: Topic::from(command.topic()),
                    payload,
                    source,
                    command,
                })
            }
            _ => {
                debug!(violations = fields.violations.len(), "SchemaGateway::validate: rejected");
                Err(ValidationError::new(kind.as_str(), fields.violations))
            }
        }
    }
}

fn parse_music(action: &str, fields: &mut FieldReader<'_>) -> Option<MusicCommand> {
    match action {
        "play" => Some(MusicCommand::Play {
            track: fields.optional_text("track"),
        }),
        "pause" => Some(MusicCommand::Pause),
        "resume" => Some(MusicCommand::Resume),
        "stop" => Some(MusicCommand::Stop),
        "next" => Some(MusicCommand::Next),
        "queue" => fields.required_text("track").map(|track| MusicCommand::Queue { track }),
        "volume" => fields
            .required_number("volume_level", 0.0, 1.0)
            .map(|level| MusicCommand::Volume { level }),
        _ => None,
    }
}

fn parse_dj(action: &str, fields: &mut FieldReader<'_>) -> Option<DjCommand> {
    match action {
        "start" => Some(DjCommand::Start),
        "stop" => Some(DjCommand::Stop),
        "next" => Some(DjCommand::Next),
        "update_settings" => {
            if !fields.has("transition_duration") {
                fields.violation("transition_duration", "at least one setting is required");
                return None;
            }
            fields
                .required_number("transition_duration", MIN_TRANSITION_SECS, MAX_TRANSITION_SECS)
                .map(|secs| DjCommand::UpdateSettings {
                    transition_duration: Some(secs),
                })
        }
        _ => None,
    }
}

fn parse_system(action: &str, fields: &mut FieldReader<'_>) -> Option<SystemCommand> {
    match action {
        "set_mode" => {
            let raw = fields.required_text("mode")?;
            match raw.parse::<Mode>() {
                Ok(mode) => Some(SystemCommand::SetMode { mode }),
                Err(e) => {
                    fields.violation("mode", e.to_string());
                    None
                }
            }
        }
        "restart" => Some(SystemCommand::Restart {
            service: fields.optional_text("service"),
        }),
        "refresh_config" => Some(SystemCommand::RefreshConfig),
        _ => None,
    }
}

/// Reads typed fields, remembering which ones the schema consumed
struct FieldReader<'a> {
    raw: &'a Payload,
    consumed: BTreeSet<&'a str>,
    violations: Vec<FieldError>,
}

impl<'a> FieldReader<'a> {
    fn new(raw: &'a Payload) -> Self {
        Self {
            raw,
            consumed: ENVELOPE_FIELDS.into_iter().collect(),
            violations: Vec::new(),
        }
    }

    fn violation(&mut self, field: &str, message: impl Into<String>) {
        self.violations.push(FieldError::new(field, message));
    }

    fn has(&self, field: &str) -> bool {
        self.raw.contains_key(field)
    }

    fn take(&mut self, field: &'a str) -> Option<&'a Value> {
        self.consumed.insert(field);
        self.raw.get(field)
    }

    fn text(&mut self, field: &'a str, required: bool) -> Option<String> {
        match self.take(field) {
            None if required => {
                self.violation(field, "required");
                None
            }
            None => None,
            Some(Value::String(s)) if s.trim().is_empty() => {
                self.violation(field, "must not be empty");
                None
            }
            Some(Value::String(s)) => Some(s.trim().to_string()),
            Some(_) => {
                self.violation(field, "must be a string");
                None
            }
        }
    }

    fn optional_text(&mut self, field: &'a str) -> Option<String> {
        self.text(field, false)
    }

    fn required_text(&mut self, field: &'a str) -> Option<String> {
        self.text(field, true)
    }

    fn required_number(&mut self, field: &'a str, min: f64, max: f64) -> Option<f64> {
        match self.take(field) {
            None => {
                self.violation(field, "required");
                None
            }
            Some(value) => match value.as_f64() {
                Some(n) if (min..=max).contains(&n) => Some(n),
                Some(_) => {
                    self.violation(field, format!("must be between {} and {}", min, max));
                    None
                }
                None => {
                    self.violation(field, "must be a number");
                    None
                }
            },
        }
    }

    /// Flag every field the chosen action did not read
    fn reject_unknown(&mut self) {
        let unknown: Vec<String> = self
            .raw
            .keys()
            .filter(|k| !self.consumed.contains(k.as_str()))
            .cloned()
            .collect();
        for field in unknown {
            self.violation(&field, "unknown field");
        }
    }
}
