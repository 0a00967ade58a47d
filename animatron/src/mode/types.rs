//! Mode and transition types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Operating mode of the assistant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Idle,
    Ambient,
    Interactive,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::Ambient => "ambient",
            Mode::Interactive => "interactive",
        }
    }

    /// LED behaviour requested when entering this mode
    pub fn led_behavior(&self) -> &'static str {
        match self {
            Mode::Idle => "off",
            Mode::Ambient => "breathing",
            Mode::Interactive => "attentive",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown mode '{0}' (expected idle, ambient or interactive)")]
pub struct ParseModeError(pub String);

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(Mode::Idle),
            "ambient" => Ok(Mode::Ambient),
            "interactive" => Ok(Mode::Interactive),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

/// Lifecycle status of a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionStatus {
    Started,
    Completed,
    Failed,
}

impl TransitionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransitionStatus::Started)
    }
}

/// A mode transition record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub id: Uuid,
    pub from_mode: Mode,
    pub to_mode: Mode,
    pub status: TransitionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Transition {
    pub(crate) fn start(from_mode: Mode, to_mode: Mode) -> Self {
        Self {
            id: Uuid::now_v7(),
            from_mode,
            to_mode,
            status: TransitionStatus::Started,
            error: None,
        }
    }

    pub(crate) fn completed(mut self) -> Self {
        self.status = TransitionStatus::Completed;
        self
    }

    pub(crate) fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = TransitionStatus::Failed;
        self.error = Some(error.into());
        self
    }
}

/// Why a transition request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionRejected {
    #[error("already in target mode ({mode})")]
    AlreadyInMode { mode: Mode },

    #[error("transition in progress ({from} -> {to})")]
    InProgress { from: Mode, to: Mode },
}

impl TransitionRejected {
    /// Stable code for client-facing replies
    pub fn code(&self) -> &'static str {
        match self {
            TransitionRejected::AlreadyInMode { .. } => "already_in_mode",
            TransitionRejected::InProgress { .. } => "transition_in_progress",
        }
    }

    /// Short human-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            TransitionRejected::AlreadyInMode { .. } => "already in target mode",
            TransitionRejected::InProgress { .. } => "transition in progress",
        }
    }
}
