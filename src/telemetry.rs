//! Logging bootstrap for chronoraft binaries.

use crate::{Error, Result};

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Output format for the fmt subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var("CHRONORAFT_LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::Config(format!(
                "CHRONORAFT_LOG_FORMAT must be one of [json, pretty], got '{other}'"
            ))),
        }
    }
}

/// Install the global tracing subscriber for a binary.
pub fn init_for_component(component: &str, log_level: &str) -> Result<()> {
    let level = parse_log_level(log_level)?;
    let format = LogFormat::from_env()?;

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true);

    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    installed
        .map_err(|e| Error::Config(format!("failed to initialize tracing subscriber: {e}")))?;

    info!(component, level = %level, "Logging initialized");
    Ok(())
}

fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}
