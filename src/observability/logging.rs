//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` takes precedence over
//! the configured level when it is set.

use crate::core::error::{OptimizerError, OptimizerResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;
use tracing_subscriber::{fmt as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Json => f.write_str("json"),
            LogFormat::Text => f.write_str("text"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "pretty" => Ok(LogFormat::Text),
            other => Err(OptimizerError::config(format!("Unknown log format: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `production_optimizer=debug`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        match EnvFilter::try_new(&self.level) {
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("logging: invalid level '{}': {}", self.level, e)],
        }
    }

    fn env_filter(&self) -> OptimizerResult<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|e| OptimizerError::config(format!("Invalid log level '{}': {}", self.level, e))),
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> OptimizerResult<()> {
    let filter = config.env_filter()?;

    let installed = match config.format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(fmt_layer::layer().json().with_current_span(true).with_target(true))
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(filter)
            .with(fmt_layer::layer().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    installed.map_err(|e| OptimizerError::internal(format!("Failed to install tracing subscriber: {}", e)))?;

    info!(level = %config.level, format = %config.format, "Logging initialized");
    Ok(())
}
