//! Structured logging setup
//!
//! The crate itself only emits `tracing` events. Binaries embedding it call
//! [`init`] once at startup; `RUST_LOG` takes precedence over the configured
//! level when set.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LoggingConfig};
use crate::{Result, StreamError};

/// Install the global subscriber described by `config`
///
/// # Errors
///
/// `Config` if the level is not a valid filter directive or a global
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_target(true).with_line_number(true).with_file(false))
            .try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact().with_target(true)).try_init(),
    };

    installed.map_err(|e| StreamError::config(format!("cannot install log subscriber: {e}")))
}

/// Build the event filter: `RUST_LOG` if set, the configured level otherwise
pub fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    parse_level(&config.level)
}

fn parse_level(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level)
        .map_err(|e| StreamError::config(format!("invalid log level '{level}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_levels_and_directives() {
        assert!(parse_level("info").is_ok());
        assert!(parse_level("warn,framecast=trace").is_ok());
        assert!(parse_level("framecast::bus=debug").is_ok());
    }

    #[test]
    fn rejects_garbage_levels() {
        let err = parse_level("framecast=loudest").unwrap_err();
        assert!(matches!(err, StreamError::Config { .. }));
    }

    #[test]
    fn second_init_fails() {
        let config = LoggingConfig { level: "warn".into(), format: LogFormat::Compact };
        let _ = init(&config);
        assert!(init(&config).is_err());
    }
}
