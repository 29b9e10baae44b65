//! Telemetry and Observability
//!
//! Handles setting up `tracing-subscriber` for structured logging of runs,
//! steps and provider calls. Supports config-driven log levels, `RUST_LOG`
//! overrides, and format switching between pretty and JSON output.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty in debug builds, JSON in release builds
    Auto,
    Pretty,
    Json,
}

impl LogFormat {
    /// Parse a config value; unknown values fall back to `Auto`.
    pub fn parse(value: &str) -> Self {
        match value {
            "pretty" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            _ => LogFormat::Auto,
        }
    }

    fn resolve(self) -> Self {
        match self {
            LogFormat::Auto if cfg!(debug_assertions) => LogFormat::Pretty,
            LogFormat::Auto => LogFormat::Json,
            other => other,
        }
    }
}

/// Build the env filter for a level.
///
/// Priority: `RUST_LOG` env var > `log_level` parameter.
fn env_filter(log_level: &str) -> EnvFilter {
    let default_filter = format!("{},cairn_engine={}", log_level, log_level);
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Initialize the tracing subscriber.
///
/// Logs go to stderr so that `--json` command output on stdout stays parseable.
/// Calling this more than once is a no-op.
pub fn init_telemetry(log_level: &str, format: LogFormat) {
    let filter = env_filter(log_level);

    match format.resolve() {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .ok();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("whatever"), LogFormat::Auto);
        assert_ne!(LogFormat::Auto.resolve(), LogFormat::Auto);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_telemetry("debug", LogFormat::Pretty);
        init_telemetry("info", LogFormat::Json);
        tracing::info!("telemetry initialized");
    }
}
