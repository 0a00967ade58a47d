//! Animatron configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gateway::{DEFAULT_SOURCE, MAX_TRANSITION_SECS, MIN_TRANSITION_SECS};

/// Main Animatron configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error); `--log-level` overrides it
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Event bus sizing
    pub bus: BusConfig,

    /// Mode transitions
    pub mode: ModeConfig,

    /// DJ automation
    pub dj: DjConfig,

    /// Command gateway
    pub gateway: GatewayConfig,

    /// Control socket
    pub ipc: IpcConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if self.bus.replay_capacity == 0 {
            return Err(eyre::eyre!("bus.replay-capacity must be at least 1"));
        }
        if self.bus.observer_capacity == 0 {
            return Err(eyre::eyre!("bus.observer-capacity must be at least 1"));
        }
        if self.mode.transition_timeout_ms == 0 {
            return Err(eyre::eyre!("mode.transition-timeout-ms must be greater than 0"));
        }
        let secs = self.dj.transition_duration_secs as f64;
        if !(MIN_TRANSITION_SECS..=MAX_TRANSITION_SECS).contains(&secs) {
            return Err(eyre::eyre!(
                "dj.transition-duration-secs must be between {} and {}, got {}",
                MIN_TRANSITION_SECS,
                MAX_TRANSITION_SECS,
                self.dj.transition_duration_secs
            ));
        }
        if self.gateway.default_source.trim().is_empty() {
            return Err(eyre::eyre!("gateway.default-source must not be empty"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .animatron.yml
        let local_config = PathBuf::from(".animatron.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/animatron/animatron.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("animatron").join("animatron.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Event bus sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Events retained for reconnecting observers
    #[serde(rename = "replay-capacity")]
    pub replay_capacity: usize,

    /// Live observer channel depth before slow observers lag
    #[serde(rename = "observer-capacity")]
    pub observer_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            replay_capacity: 100,
            observer_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    /// Bound on mode setup in milliseconds
    #[serde(rename = "transition-timeout-ms")]
    pub transition_timeout_ms: u64,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            transition_timeout_ms: 5000,
        }
    }
}

impl ModeConfig {
    pub fn transition_timeout(&self) -> Duration {
        Duration::from_millis(self.transition_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DjConfig {
    /// Seconds between automatic track transitions
    #[serde(rename = "transition-duration-secs")]
    pub transition_duration_secs: u64,
}

impl Default for DjConfig {
    fn default() -> Self {
        Self {
            transition_duration_secs: 30,
        }
    }
}

impl DjConfig {
    pub fn transition_duration(&self) -> Duration {
        Duration::from_secs(self.transition_duration_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Source recorded on commands that do not name one
    #[serde(rename = "default-source")]
    pub default_source: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_source: DEFAULT_SOURCE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Control socket path; defaults to the runtime directory
    #[serde(rename = "socket-path")]
    pub socket_path: Option<PathBuf>,
}
