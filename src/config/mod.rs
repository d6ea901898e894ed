//! Agent Configuration Module
//!
//! Static configuration loaded once at startup from a TOML file with
//! environment overrides. Runtime-mutable state (MQTT endpoint, tracking
//! flag, operator registration) lives in the settings store instead —
//! see `storage::settings`.
//!
//! ## Loading Order
//!
//! 1. `AURA_CONFIG` environment variable (path to TOML file)
//! 2. `aura.toml` in the current working directory
//! 3. Built-in defaults

pub mod defaults;

use serde::Deserialize;
use std::path::Path;

/// Static agent configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Stable tag for the physical unit, e.g. `TRK-101`. Part of every
    /// topic the agent publishes to.
    pub device_tag: String,

    /// Directory holding the sled database (queue + settings).
    pub data_dir: String,

    /// MQTT host used to seed the settings store on first boot.
    pub mqtt_host: String,

    /// MQTT port used to seed the settings store on first boot.
    pub mqtt_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_tag: "TRK-000".to_string(),
            data_dir: "./data".to_string(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
        }
    }
}

impl AgentConfig {
    /// Load configuration following the documented order, applying
    /// environment overrides on top of whatever file (if any) was found.
    pub fn load() -> Self {
        let mut config = Self::load_file().unwrap_or_default();
        config.apply_env_overrides();
        config
    }

    fn load_file() -> Option<Self> {
        let path = std::env::var("AURA_CONFIG").unwrap_or_else(|_| "aura.toml".to_string());

        if !Path::new(&path).exists() {
            tracing::debug!(path = %path, "No config file found, using defaults");
            return None;
        }

        match std::fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str::<Self>(&raw) {
                Ok(config) => {
                    tracing::info!(path = %path, "Loaded agent config");
                    Some(config)
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Invalid config file, using defaults");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Could not read config file, using defaults");
                None
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(tag) = std::env::var("AURA_DEVICE_TAG") {
            self.device_tag = tag;
        }
        if let Ok(dir) = std::env::var("AURA_DATA_DIR") {
            self.data_dir = dir;
        }
        if let Ok(host) = std::env::var("AURA_MQTT_HOST") {
            self.mqtt_host = host;
        }
        if let Ok(port) = std::env::var("AURA_MQTT_PORT").map(|p| p.parse::<u16>()) {
            match port {
                Ok(port) => self.mqtt_port = port,
                Err(e) => tracing::warn!(error = %e, "Invalid AURA_MQTT_PORT, keeping previous value"),
            }
        }
    }

    /// Telemetry topic for this unit: `<base>/<device_tag>/telemetry`.
    pub fn telemetry_topic(&self) -> String {
        format!("{}/{}/telemetry", defaults::BASE_TOPIC, self.device_tag)
    }

    /// Discrete-event topic for this unit: `<base>/<device_tag>/events`.
    pub fn events_topic(&self) -> String {
        format!("{}/{}/events", defaults::BASE_TOPIC, self.device_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.data_dir, "./data");
    }

    #[test]
    fn test_topic_derivation() {
        let config = AgentConfig {
            device_tag: "TRK-101".to_string(),
            ..AgentConfig::default()
        };
        assert_eq!(config.telemetry_topic(), "aura/tracking/TRK-101/telemetry");
        assert_eq!(config.events_topic(), "aura/tracking/TRK-101/events");
    }

    #[test]
    fn test_partial_toml() {
        let config: AgentConfig =
            toml::from_str("device_tag = \"TRK-7\"").unwrap();
        assert_eq!(config.device_tag, "TRK-7");
        // Unspecified fields fall back to defaults
        assert_eq!(config.mqtt_port, 1883);
    }
}
