//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::debug;

/// Animatron - event-driven orchestration core for an animatronic assistant
#[derive(Parser)]
#[command(
    name = "am",
    about = "Orchestration core for an animatronic assistant",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the assistant in the foreground
    Run,

    /// Send a command (e.g. `am send music volume -f volume_level=0.4`)
    Send {
        /// Command type (voice, music, dj, system)
        #[arg(value_name = "TYPE")]
        command_type: String,

        /// Action name
        action: String,

        /// Extra fields as key=value; values parse as JSON, else as strings
        #[arg(short = 'f', long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,

        /// Source to record instead of the configured default
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Print buffered events
    Snapshot {
        /// Only events after this sequence id
        #[arg(long)]
        since: Option<u64>,

        /// Output format
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print buffered events, then stream new ones
    Follow {
        /// Only events after this sequence id
        #[arg(long)]
        since: Option<u64>,

        /// Output format
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show mode, services and DJ state
    Status {
        /// Output format
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Check that the assistant is running
    Ping,

    /// Stop a running assistant
    Stop,
}

/// Build a command object from CLI arguments
pub fn build_command(command_type: &str, action: &str, fields: &[String], source: Option<&str>) -> Result<Value, String> {
    debug!(%command_type, %action, ?fields, "build_command: called");
    let mut command = Map::new();
    command.insert("type".to_string(), Value::String(command_type.to_string()));
    command.insert("action".to_string(), Value::String(action.to_string()));
    if let Some(source) = source {
        command.insert("source".to_string(), Value::String(source.to_string()));
    }
    for field in fields {
        let (key, value) = parse_field(field)?;
        command.insert(key, value);
    }
    Ok(Value::Object(command))
}

/// Parse `key=value`; the value is JSON when it parses as JSON, otherwise a string
pub fn parse_field(field: &str) -> Result<(String, Value), String> {
    let Some((key, raw)) = field.split_once('=') else {
        return Err(format!("invalid field '{}': expected KEY=VALUE", field));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid field '{}': empty key", field));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("animatron")
        .join("logs")
        .join("animatron.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Output format for snapshot/status commands
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use 'text' or 'json'", s)),
        }
    }
}
