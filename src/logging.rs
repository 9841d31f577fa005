//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the filter:
//! 1. the `level` argument (if provided)
//! 2. `TASKFLOW_LOG` environment variable (any `EnvFilter` directive)
//! 3. default to `info`
//!
//! Logs go to STDERR. The JSON format emits one object per event so that
//! the `pipeline` / `step` fields can be queried by a log collector.

use std::str::FromStr;

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

pub const ENV_LOG: &str = "TASKFLOW_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!(
                "invalid log format: {other} (expected \"text\" or \"json\")"
            )),
        }
    }
}

/// Initialise the global logging subscriber.
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(format: LogFormat, level: Option<tracing::Level>) -> Result<()> {
    let filter = build_filter(level, std::env::var(ENV_LOG).ok().as_deref());

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}

fn build_filter(level: Option<tracing::Level>, env_value: Option<&str>) -> EnvFilter {
    if let Some(level) = level {
        return EnvFilter::new(level.to_string().to_lowercase());
    }
    env_value
        .and_then(|s| EnvFilter::try_new(s.trim()).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}
