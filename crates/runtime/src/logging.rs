//! Structured logging setup
//!
//! Library code only emits `tracing` events. Binaries call [`init_logging`]
//! once at startup to install a subscriber.

use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, LogFormat, LoggingConfig};

/// Build the level filter. `RUST_LOG`, when set, wins over the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    EnvFilter::try_new(&config.level).map_err(|e| ConfigError::InvalidValue {
        key: "logging.level".to_string(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber for the configured format.
///
/// A subscriber that is already installed is left in place.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_invalid_level_is_a_config_error() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "scoutbox=loud".to_string(),
            format: LogFormat::Compact,
        };
        assert!(matches!(
            env_filter(&config),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_init_twice_is_harmless() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig::default();
        init_logging(&config).unwrap();
        init_logging(&config).unwrap();
    }
}
