//! Closed command vocabulary
//!
//! Raw action strings are resolved into these variants once, at the gateway.
//! Everything downstream matches on variants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::events::{Event, Payload, topics};
use crate::mode::Mode;

use super::error::{FieldError, ValidationError};

/// Command family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Voice,
    Music,
    Dj,
    System,
}

impl CommandType {
    pub const ALL: [CommandType; 4] = [CommandType::Voice, CommandType::Music, CommandType::Dj, CommandType::System];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Voice => "voice",
            CommandType::Music => "music",
            CommandType::Dj => "dj",
            CommandType::System => "system",
        }
    }

    /// Bus topic canonical commands of this family are published on
    pub fn topic(&self) -> &'static str {
        match self {
            CommandType::Voice => topics::VOICE_COMMAND,
            CommandType::Music => topics::MUSIC_COMMAND,
            CommandType::Dj => topics::DJ_COMMAND,
            CommandType::System => topics::SYSTEM_COMMAND,
        }
    }

    /// Accepted action names
    pub fn actions(&self) -> &'static [&'static str] {
        match self {
            CommandType::Voice => &["start", "stop"],
            CommandType::Music => &["play", "pause", "resume", "stop", "next", "queue", "volume"],
            CommandType::Dj => &["start", "stop", "next", "update_settings"],
            CommandType::System => &["set_mode", "restart", "refresh_config"],
        }
    }

    /// Command family for a canonical command topic
    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.topic() == topic)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown command type '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCommand {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MusicCommand {
    Play { track: Option<String> },
    Pause,
    Resume,
    Stop,
    Next,
    Queue { track: String },
    /// Level in [0, 1]
    Volume { level: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DjCommand {
    Start,
    Stop,
    Next,
    /// Transition duration in seconds
    UpdateSettings { transition_duration: Option<f64> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemCommand {
    SetMode { mode: Mode },
    Restart { service: Option<String> },
    RefreshConfig,
}

/// A validated command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Voice(VoiceCommand),
    Music(MusicCommand),
    Dj(DjCommand),
    System(SystemCommand),
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Voice(_) => CommandType::Voice,
            Command::Music(_) => CommandType::Music,
            Command::Dj(_) => CommandType::Dj,
            Command::System(_) => CommandType::System,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Command::Voice(VoiceCommand::Start) => "start",
            Command::Voice(VoiceCommand::Stop) => "stop",
            Command::Music(m) => match m {
                MusicCommand::Play { .. } => "play",
                MusicCommand::Pause => "pause",
                MusicCommand::Resume => "resume",
                MusicCommand::Stop => "stop",
                MusicCommand::Next => "next",
                MusicCommand::Queue { .. } => "queue",
                MusicCommand::Volume { .. } => "volume",
            },
            Command::Dj(d) => match d {
                DjCommand::Start => "start",
                DjCommand::Stop => "stop",
                DjCommand::Next => "next",
                DjCommand::UpdateSettings { .. } => "update_settings",
            },
            Command::System(s) => match s {
                SystemCommand::SetMode { .. } => "set_mode",
                SystemCommand::Restart { .. } => "restart",
                SystemCommand::RefreshConfig => "refresh_config",
            },
        }
    }

    pub fn topic(&self) -> &'static str {
        self.command_type().topic()
    }

    /// Canonical payload: `{action, <fields>, source}`
    pub fn to_payload(&self, source: &str) -> Payload {
        let mut payload = Payload::new();
        payload.insert("action".to_string(), json!(self.action()));
        match self {
            Command::Music(MusicCommand::Play { track: Some(track) }) | Command::Music(MusicCommand::Queue { track }) => {
                payload.insert("track".to_string(), json!(track));
            }
            Command::Music(MusicCommand::Volume { level }) => {
                payload.insert("volume".to_string(), json!(level));
            }
            Command::Dj(DjCommand::UpdateSettings {
                transition_duration: Some(secs),
            }) => {
                payload.insert("transition_duration".to_string(), json!(secs));
            }
            Command::System(SystemCommand::SetMode { mode }) => {
                payload.insert("mode".to_string(), json!(mode));
            }
            Command::System(SystemCommand::Restart { service: Some(service) }) => {
                payload.insert("service".to_string(), json!(service));
            }
            _ => {}
        }
        payload.insert("source".to_string(), json!(source));
        payload
    }

    /// Parse a canonical command event back into its variant
    ///
    /// Only understands the canonical field names produced by [`Command::to_payload`].
    pub fn from_event(event: &Event) -> Result<Self, ValidationError> {
        let Some(command_type) = CommandType::from_topic(event.topic.as_str()) else {
            return Err(ValidationError::new(
                event.topic.to_string(),
                vec![FieldError::new("topic", "not a command topic")],
            ));
        };
        let invalid = |field: &str, message: &str| {
            ValidationError::new(command_type.as_str(), vec![FieldError::new(field, message)])
        };
        let action = event.str_field("action").ok_or_else(|| invalid("action", "required"))?;
        let text = |key: &str| event.str_field(key).map(str::to_string);

        let command = match (command_type, action) {
            (CommandType::Voice, "start") => Command::Voice(VoiceCommand::Start),
            (CommandType::Voice, "stop") => Command::Voice(VoiceCommand::Stop),
            (CommandType::Music, "play") => Command::Music(MusicCommand::Play { track: text("track") }),
            (CommandType::Music, "pause") => Command::Music(MusicCommand::Pause),
            (CommandType::Music, "resume") => Command::Music(MusicCommand::Resume),
            (CommandType::Music, "stop") => Command::Music(MusicCommand::Stop),
            (CommandType::Music, "next") => Command::Music(MusicCommand::Next),
            (CommandType::Music, "queue") => Command::Music(MusicCommand::Queue {
                track: text("track").ok_or_else(|| invalid("track", "required"))?,
            }),
            (CommandType::Music, "volume") => Command::Music(MusicCommand::Volume {
                level: event.f64_field("volume").ok_or_else(|| invalid("volume", "required"))?,
            }),
            (CommandType::Dj, "start") => Command::Dj(DjCommand::Start),
            (CommandType::Dj, "stop") => Command::Dj(DjCommand::Stop),
            (CommandType::Dj, "next") => Command::Dj(DjCommand::Next),
            (CommandType::Dj, "update_settings") => Command::Dj(DjCommand::UpdateSettings {
                transition_duration: event.f64_field("transition_duration"),
            }),
            (CommandType::System, "set_mode") => {
                let mode = event
                    .payload
                    .get("mode")
                    .and_then(Value::as_str)
                    .and_then(|m| m.parse::<Mode>().ok())
                    .ok_or_else(|| invalid("mode", "required"))?;
                Command::System(SystemCommand::SetMode { mode })
            }
            (CommandType::System, "restart") => Command::System(SystemCommand::Restart {
                service: text("service"),
            }),
            (CommandType::System, "refresh_config") => Command::System(SystemCommand::RefreshConfig),
            (_, other) => return Err(invalid("action", &format!("unknown action '{}'", other))),
        };
        Ok(command)
    }
}
