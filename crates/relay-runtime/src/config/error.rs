//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] figment::Error),

    #[error("invalid configuration: {message}")]
    ValidationError { message: String },
}

impl ConfigError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError { message: message.into() }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
