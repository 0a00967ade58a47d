//! Validation errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One violated constraint on one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// A rejected command with every violation found
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("invalid {command_type} command: {}", summarize(.errors))]
pub struct ValidationError {
    pub command_type: String,
    pub errors: Vec<FieldError>,
}

impl ValidationError {
    pub fn new(command_type: impl Into<String>, errors: Vec<FieldError>) -> Self {
        Self {
            command_type: command_type.into(),
            errors,
        }
    }

    /// Whether a given field has a violation
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}
