//! Configuration validation (§4.9).

use super::error::{ConfigError, ConfigResult};
use super::schema::RelayConfig;

pub fn validate_config(config: &RelayConfig) -> ConfigResult<()> {
    if config.listener.operation_timeout_secs == 0 {
        return Err(ConfigError::validation("listener.operation_timeout_secs must be greater than 0"));
    }
    if config.client.operation_timeout_secs == 0 {
        return Err(ConfigError::validation("client.operation_timeout_secs must be greater than 0"));
    }
    if config.listener.reconnect_schedule_secs.is_empty() {
        return Err(ConfigError::validation("listener.reconnect_schedule_secs must not be empty"));
    }
    if config.listener.connection_buffer_bytes < 4096 {
        return Err(ConfigError::validation("listener.connection_buffer_bytes must be at least 4096"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&RelayConfig::default()).is_ok());
    }

    #[test]
    fn rejects_zero_operation_timeout() {
        let mut config = RelayConfig::default();
        config.listener.operation_timeout_secs = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_empty_reconnect_schedule() {
        let mut config = RelayConfig::default();
        config.listener.reconnect_schedule_secs.clear();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_undersized_buffer() {
        let mut config = RelayConfig::default();
        config.listener.connection_buffer_bytes = 1024;
        assert!(validate_config(&config).is_err());
    }
}
