//! Logging setup for worker hosts and test harnesses.
//!
//! The filter comes from the `FITTRACK_LOG` environment variable when set
//! (standard `RUST_LOG` directive syntax), otherwise from the configured
//! level.

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable consulted for the log filter.
pub const LOG_ENV_VAR: &str = "FITTRACK_LOG";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines for development.
    #[default]
    Text,
    /// Structured JSON for log collection.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Include source file and line in each event.
    pub include_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Text,
            include_location: false,
        }
    }
}

impl LogConfig {
    /// Structured output for hosts that ship logs somewhere.
    pub fn json() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }
}

/// Install the global subscriber. Later calls are no-ops, so tests can
/// call this unconditionally.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, LogFormat::Text);
        assert!(!config.include_location);
    }

    #[test]
    fn test_log_config_json() {
        let config = LogConfig::json();
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging(&LogConfig::default());
        // A second call must not panic.
        init_logging(&LogConfig::json());
    }
}
