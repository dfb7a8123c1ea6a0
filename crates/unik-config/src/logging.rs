//! Structured logging utilities for unik components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use unik_config::{log_manifest_warn, log_mkfs_info};
//!
//! log_manifest_warn!("Broken symlink skipped", path = "/lib/libfoo.so");
//! log_mkfs_info!("Root filesystem written", uuid = "...");
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const MANIFEST: &'static str = "MANIFEST";
    pub const TFS: &'static str = "TFS";
    pub const MKFS: &'static str = "MKFS";
    pub const READER: &'static str = "READER";
    pub const CLI: &'static str = "CLI";
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
    /// Parse a level name as written in config files ("warn", "DEBUG", ...)
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === MANIFEST logging macros ===

#[macro_export]
macro_rules! log_manifest_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "MANIFEST", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_manifest_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "MANIFEST", $($key = $value,)* $msg)
    };
}

// === TFS logging macros ===

#[macro_export]
macro_rules! log_tfs_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "TFS", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_tfs_trace {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::trace!(component = "TFS", $($key = $value,)* $msg)
    };
}

// === MKFS logging macros ===

#[macro_export]
macro_rules! log_mkfs_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "MKFS", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_mkfs_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "MKFS", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_mkfs_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "MKFS", $($key = $value,)* $msg)
    };
}

// === READER logging macros ===

#[macro_export]
macro_rules! log_reader_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "READER", $($key = $value,)* $msg)
    };
}

// === CLI logging macros ===

#[macro_export]
macro_rules! log_cli_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CLI", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cli_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CLI", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
///
/// `UNIK_LOG` takes precedence over `RUST_LOG`; `level` applies when neither is set.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_env("UNIK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
