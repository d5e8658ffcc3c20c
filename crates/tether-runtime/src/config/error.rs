//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating a [`TetherConfig`](super::TetherConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// The merged sources could not be extracted into the schema.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// A value is out of range or inconsistent.
    #[error("Invalid configuration: {message}")]
    ValidationError { message: String },

    /// A required field is empty.
    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    /// Two bots share a name, and so would share their artifact files.
    #[error("Duplicate bot name: {0}")]
    DuplicateBotName(String),

    /// A web base URL is malformed or not http(s).
    #[error("Invalid URL for {host}: {url} - {reason}")]
    InvalidUrl {
        host: String,
        url: String,
        reason: String,
    },

    /// A handshake public key is not valid hex.
    #[error("Invalid public key for universe '{universe}': {reason}")]
    InvalidUniverseKey { universe: String, reason: String },
}

impl ConfigError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid_url(
        host: impl Into<String>,
        url: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidUrl {
            host: host.into(),
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
