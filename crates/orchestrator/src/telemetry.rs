//! Tracing subscriber setup
//!
//! Host processes call [`init_tracing`] once at startup. Calling it again is
//! harmless: the first installed subscriber wins.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
    pub format: LogFormat,
    pub with_target: bool,
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            with_target: true,
            ansi: true,
        }
    }
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init_tracing(config: &TelemetryConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(config.with_target))
            .try_init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(config.with_target)
                    .with_ansi(config.ansi),
            )
            .try_init(),
    };

    installed.is_ok()
}
