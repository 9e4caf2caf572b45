//! # rost-config
//!
//! Configuration management for the rost sysroot daemon.
//!
//! Loads configuration from:
//! 1. `/etc/rost/sysrootd.toml` (system-wide)
//! 2. An explicit file passed on the command line (merged over system-wide, key by key)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// System-wide config location
pub const SYSTEM_CONFIG_PATH: &str = "/etc/rost/sysrootd.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sysroot: SysrootConfig,
    pub daemon: DaemonConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from the standard location plus environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load config, layering `explicit` (if any) over the system-wide file.
    ///
    /// Does not validate: callers apply their own overrides first and then
    /// call [`Config::validate`] once.
    pub fn load_from(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        let mut layers = Vec::new();
        if system_path.exists() {
            layers.push(system_path);
        }
        layers.extend(explicit);

        let mut config = Self::load_layers(&layers)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Merge TOML files in order; keys set by a later file win, keys it
    /// leaves out keep the earlier value
    pub fn load_layers(paths: &[&Path]) -> Result<Self, ConfigError> {
        let mut merged = toml::value::Table::new();
        for path in paths {
            debug!("Loading config layer from {:?}", path);
            let contents = std::fs::read_to_string(path)?;
            let layer: toml::value::Table = toml::from_str(&contents)?;
            merge_tables(&mut merged, layer);
        }
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("ROST_SYSROOT") {
            self.sysroot.path = PathBuf::from(path);
        }
        if let Ok(socket) = std::env::var("ROST_SOCKET") {
            self.daemon.socket = PathBuf::from(socket);
        }
        if let Ok(secs) = std::env::var("ROST_DEBOUNCE_SECS") {
            if let Ok(n) = secs.parse() {
                self.sysroot.debounce_secs = n;
            }
        }
    }

    /// Reject values the daemon cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sysroot.debounce_secs == 0 {
            return Err(ConfigError::Invalid(
                "sysroot.debounce_secs must be at least 1".to_string(),
            ));
        }
        if !self.sysroot.path.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "sysroot.path must be absolute: {}",
                self.sysroot.path.display()
            )));
        }
        Ok(())
    }

    /// Debounce window used to coalesce change notifications
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.sysroot.debounce_secs)
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

fn merge_tables(base: &mut toml::value::Table, overlay: toml::value::Table) {
    for (key, value) in overlay {
        let replacement = match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
                None
            }
            (_, value) => Some(value),
        };
        if let Some(value) = replacement {
            base.insert(key, value);
        }
    }
}

/// Deployment root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SysrootConfig {
    /// Root of the deployment store (the directory holding `ostree/`)
    pub path: PathBuf,
    /// Debounce window in seconds
    pub debounce_secs: u64,
    /// Kernel command line consulted for the booted deployment
    pub cmdline: PathBuf,
}

impl Default for SysrootConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/"),
            debounce_secs: 2,
            cmdline: PathBuf::from("/proc/cmdline"),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket path
    pub socket: PathBuf,
    /// Redirect our own stdout and forward captured lines to the active transaction
    pub capture_stdout: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/run/rost/sysrootd.sock"),
            capture_stdout: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of error, warn, info, debug, trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
