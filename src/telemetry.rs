use crate::config::{LogFormat, LoggingSettings};
use thiserror::Error;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Error)]
#[error("failed to install tracing subscriber: {0}")]
pub struct TelemetryError(String);

/// Installs the process-wide subscriber. `RUST_LOG` directives override the configured level.
///
/// Fails if a global subscriber is already set.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    let filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let output = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
        .map_err(|err| TelemetryError(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn a_second_install_is_refused() {
        let logging = LoggingSettings {
            level: LevelFilter::WARN,
            format: LogFormat::Compact,
        };

        let _ = init(&logging);
        assert!(init(&logging).is_err());
    }
}
