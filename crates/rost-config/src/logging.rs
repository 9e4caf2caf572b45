//! Structured logging utilities for the sysroot daemon.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use rost_config::log_sysroot_info;
//!
//! log_sysroot_info!("Registry reconciled", added = 1, removed = 0);
//! ```

use std::str::FromStr;

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const SYSROOT: &'static str = "SYSROOT";
    pub const WATCH: &'static str = "WATCH";
    pub const IPC: &'static str = "IPC";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

// === SYSROOT logging macros ===

#[macro_export]
macro_rules! log_sysroot_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "SYSROOT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_sysroot_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "SYSROOT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_sysroot_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "SYSROOT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_sysroot_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "SYSROOT", $($key = $value,)* $msg)
    };
}

// === WATCH logging macros ===

#[macro_export]
macro_rules! log_watch_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "WATCH", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_watch_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "WATCH", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_watch_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "WATCH", $($key = $value,)* $msg)
    };
}

// === IPC logging macros ===

#[macro_export]
macro_rules! log_ipc_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "IPC", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_ipc_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "IPC", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup. `RUST_LOG` takes precedence.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
