//! Runtime error types.

use thiserror::Error;

use tether_core::{StoreError, TransportError};
use tether_transport::WebError;

use crate::config::ConfigError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The artifact store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The HTTP layer could not be set up.
    #[error("Web error: {0}")]
    Web(#[from] WebError),

    /// The connection collaborator failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The handshake cipher could not be built.
    #[error("Invalid public key for universe '{universe}': {reason}")]
    InvalidKey { universe: String, reason: String },

    /// Bot not found.
    #[error("Bot not found: {0}")]
    BotNotFound(String),

    /// Bot already exists.
    #[error("Bot already exists: {0}")]
    BotExists(String),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
