//! Configuration management for mx4hapticd
//!
//! Maps desktop event names (and optional event arguments) to haptic effect
//! IDs. Configuration is JSON at `~/.config/mx4hapticd/config.json`, with a
//! `./config.json` fallback, and is hot-reloadable on SIGHUP via
//! [`SharedConfig`].
//!
//! SPDX-License-Identifier: GPL-3.0

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::device::ConnectionType;

// ============================================================================
// Constants
// ============================================================================

/// Application name, used for config and runtime paths
pub const APP_NAME: &str = "mx4hapticd";

/// Default config directory name under XDG config home
const CONFIG_DIR: &str = "mx4hapticd";

/// Default config file name
const CONFIG_FILE: &str = "config.json";

// ============================================================================
// Event Mapping
// ============================================================================

/// Per-event mapping with argument-specific overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventConfig {
    /// Effect used when no argument matches
    #[serde(default)]
    pub default: Option<u8>,

    /// Effect per exact event argument string
    #[serde(default)]
    pub args: HashMap<String, u8>,
}

/// An event maps either straight to an effect ID or to a detailed table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventValue {
    /// Bare effect ID
    Effect(u8),
    /// Argument-aware mapping
    Detailed(EventConfig),
}

// ============================================================================
// App Config
// ============================================================================

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global fallback effect when nothing more specific matches
    #[serde(default)]
    pub default_effect: Option<u8>,

    /// Preferred transport: "bolt" or "bluetooth" (unset = auto)
    #[serde(default)]
    pub connection: Option<String>,

    /// Explicit hidraw node path, overrides Bluetooth discovery
    #[serde(default)]
    pub device_path: Option<PathBuf>,

    /// Event name -> effect mapping
    #[serde(default)]
    pub events: HashMap<String, EventValue>,
}

impl AppConfig {
    /// Resolve the effect for an event, most specific match first:
    /// exact argument, then the event's default, then the global default.
    pub fn get_effect(&self, event_name: &str, event_args: &str) -> Option<u8> {
        match self.events.get(event_name) {
            None => self.default_effect,
            Some(EventValue::Effect(id)) => Some(*id),
            Some(EventValue::Detailed(event)) => event
                .args
                .get(event_args)
                .copied()
                .or(event.default)
                .or(self.default_effect),
        }
    }

    /// Parse the `connection` field into a transport restriction
    pub fn preferred_connection(&self) -> Option<ConnectionType> {
        match self.connection.as_deref() {
            Some(value) if value.eq_ignore_ascii_case("bolt") => Some(ConnectionType::Bolt),
            Some(value) if value.eq_ignore_ascii_case("bluetooth") => {
                Some(ConnectionType::Bluetooth)
            }
            Some(other) => {
                tracing::warn!(connection = other, "Unknown connection type in config, ignoring");
                None
            }
            None => None,
        }
    }

    /// Load configuration from a specific file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref()).map_err(ConfigError::IoError)?;
        let config: AppConfig =
            serde_json::from_str(&contents).map_err(ConfigError::ParseError)?;

        tracing::info!(
            path = %path.as_ref().display(),
            events = config.events.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Load configuration from the first existing candidate path.
    ///
    /// Candidates: the explicit path (when given), then
    /// `$XDG_CONFIG_HOME/mx4hapticd/config.json`, then `./config.json`.
    /// No candidate existing is not an error; defaults apply.
    pub fn load_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut candidates: Vec<PathBuf> = Vec::new();

        if let Some(path) = explicit {
            candidates.push(path.to_path_buf());
        } else {
            if let Some(config_dir) = dirs::config_dir() {
                candidates.push(config_dir.join(CONFIG_DIR).join(CONFIG_FILE));
            }
            candidates.push(PathBuf::from(CONFIG_FILE));
        }

        for path in &candidates {
            if path.exists() {
                return Self::load(path);
            }
        }

        tracing::warn!("No config file found, using defaults");
        Ok(AppConfig::default())
    }
}

// ============================================================================
// Shared Config (for SIGHUP hot-reload)
// ============================================================================

/// Thread-safe shared configuration
pub type SharedConfig = Arc<RwLock<AppConfig>>;

/// Create a shared configuration with defaults
pub fn new_shared_config() -> SharedConfig {
    Arc::new(RwLock::new(AppConfig::default()))
}

/// Load the shared configuration from disk
pub fn load_shared_config(explicit: Option<&Path>) -> Result<SharedConfig, ConfigError> {
    let config = AppConfig::load_default(explicit)?;
    Ok(Arc::new(RwLock::new(config)))
}

/// Runtime directory for sockets: `$XDG_RUNTIME_DIR`, `/run/user/<uid>`
/// when unset.
pub fn runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from(format!("/run/user/{}", unsafe { libc::getuid() })))
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration error type
#[derive(Debug)]
pub enum ConfigError {
    /// I/O error reading the file
    IoError(std::io::Error),
    /// JSON parse error
    ParseError(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "config I/O error: {}", e),
            ConfigError::ParseError(e) => write!(f, "config parse error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> AppConfig {
        let json = r#"{
            "default_effect": 1,
            "events": {
                "workspace": 3,
                "activewindow": {
                    "default": 5,
                    "args": {
                        "firefox": 7
                    }
                },
                "monitoradded": {
                    "args": {
                        "DP-1": 9
                    }
                }
            }
        }"#;
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_bare_effect_event() {
        let config = sample_config();
        assert_eq!(config.get_effect("workspace", "3"), Some(3));
        assert_eq!(config.get_effect("workspace", "anything"), Some(3));
    }

    #[test]
    fn test_arg_match_beats_event_default() {
        let config = sample_config();
        assert_eq!(config.get_effect("activewindow", "firefox"), Some(7));
        assert_eq!(config.get_effect("activewindow", "kitty"), Some(5));
    }

    #[test]
    fn test_global_default_fallbacks() {
        let config = sample_config();
        // Unknown event -> global default
        assert_eq!(config.get_effect("openlayer", ""), Some(1));
        // Known event, no arg match, no event default -> global default
        assert_eq!(config.get_effect("monitoradded", "HDMI-1"), Some(1));
        assert_eq!(config.get_effect("monitoradded", "DP-1"), Some(9));
    }

    #[test]
    fn test_no_defaults_at_all() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.get_effect("workspace", "1"), None);
    }

    #[test]
    fn test_preferred_connection_parsing() {
        let mut config = AppConfig::default();
        assert_eq!(config.preferred_connection(), None);

        config.connection = Some("bolt".to_string());
        assert_eq!(config.preferred_connection(), Some(ConnectionType::Bolt));

        config.connection = Some("Bluetooth".to_string());
        assert_eq!(config.preferred_connection(), Some(ConnectionType::Bluetooth));

        config.connection = Some("usb".to_string());
        assert_eq!(config.preferred_connection(), None);
    }

    #[test]
    fn test_device_path_deserializes() {
        let json = r#"{ "connection": "bluetooth", "device_path": "/dev/hidraw3" }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device_path, Some(PathBuf::from("/dev/hidraw3")));
    }

    #[test]
    fn test_load_default_missing_is_ok() {
        let missing = std::env::temp_dir().join("mx4hapticd-no-such-config.json");
        // Explicit-but-missing candidate falls through to defaults
        let config = AppConfig::load_default(Some(&missing)).unwrap();
        assert!(config.events.is_empty());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = sample_config();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get_effect("activewindow", "firefox"), Some(7));
    }
}
