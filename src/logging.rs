//! Logging setup for Alcove
//!
//! Thin wrapper over `env_logger` so embedding hosts get sensible log output
//! without wiring a logger themselves. `RUST_LOG` always wins over the
//! configured level.

use anyhow::Result;

use crate::config::LoggingConfig;

/// Initializes the global logger from the configured level.
///
/// Safe to call more than once; only the first call installs a logger.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let env = env_logger::Env::default().default_filter_or(config.level.as_str());
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        assert!(init(&config).is_ok());
        assert!(init(&config).is_ok());
    }
}
