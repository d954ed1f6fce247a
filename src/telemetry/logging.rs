//! Logging initialization.
//!
//! `RUST_LOG` wins over the config file's `[log]` section.

use crate::config::LogSection;
use tracing::Level;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Line layout of the capture log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    /// One line per event with target and fields, the default
    Full,
    Compact,
    /// Newline-delimited JSON for log shippers
    Json,
}

impl LogFormat {
    fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Full,
        }
    }
}

/// Installs the global subscriber.
///
/// Returns false when one is already installed; the first one stays.
pub fn init_logging(section: Option<&LogSection>) -> bool {
    let level = section.map_or(Level::INFO, |s| parse_level(&s.level));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let format = section.map_or(LogFormat::Full, |s| LogFormat::from_name(&s.format));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        LogFormat::Full => registry.with(fmt::layer()).try_init(),
    };
    installed.is_ok()
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}
