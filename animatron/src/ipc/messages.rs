//! IPC message types for the control socket
//!
//! Simple JSON-over-newline protocol. Each message is a single line of JSON followed by `\n`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway::{FieldError, ValidationError};

/// Requests from the dashboard bridge or CLI to the assistant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Request {
    /// Submit an untrusted command object (`{"type": ..., "action": ..., ...}`)
    Command { command: Value },

    /// Read the replay buffer, optionally only events after `since`
    Snapshot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<u64>,
    },

    /// Snapshot, then keep streaming every new event on the same connection
    Follow {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<u64>,
    },

    /// Current mode, services, DJ and bus counters
    Status,

    /// Ping to check if the assistant is alive
    Ping,

    /// Request the assistant to stop gracefully
    Shutdown,
}

/// Reply envelope: `{"status":"ok","data":...}` or `{"status":"error",...}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok {
        #[serde(default)]
        data: Value,
    },

    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        errors: Vec<FieldError>,
        /// Machine-readable reason (`validation`, `gap`, `lagged`, `bad_request`)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Response::Ok { data }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
            errors: Vec::new(),
            code: Some(code.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }

    /// Unwrap the data of an ok response, turning an error response into an eyre error
    pub fn into_data(self) -> eyre::Result<Value> {
        match self {
            Response::Ok { data } => Ok(data),
            Response::Error { message, errors, .. } if errors.is_empty() => Err(eyre::eyre!("{}", message)),
            Response::Error { message, errors, .. } => {
                let details: Vec<String> = errors.iter().map(|e| format!("{}: {}", e.field, e.message)).collect();
                Err(eyre::eyre!("{} [{}]", message, details.join("; ")))
            }
        }
    }
}

impl From<ValidationError> for Response {
    fn from(err: ValidationError) -> Self {
        Response::Error {
            message: err.to_string(),
            errors: err.errors,
            code: Some("validation".to_string()),
        }
    }
}
