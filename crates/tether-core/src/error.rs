//! Unified error types for the Tether core.
//!
//! Web-layer errors (`WebError`) live in `tether-transport`; configuration and
//! runtime errors live in `tether-runtime`.

use thiserror::Error;

// =============================================================================
// Transport Errors
// =============================================================================

/// Errors reported by the connection collaborator.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connection failed: {reason}")]
    ConnectionFailed {
        /// Reason for failure.
        reason: String,
    },

    /// The operation needs a live connection.
    #[error("not connected")]
    NotConnected,

    /// The operation needs an authenticated connection.
    #[error("not logged on")]
    NotLoggedOn,

    /// A request to the service timed out.
    #[error("request timed out")]
    Timeout,

    /// The inbound event feed was already handed out.
    #[error("event feed already taken")]
    EventFeedTaken,

    /// Failed to send a command.
    #[error("failed to send command: {0}")]
    SendFailed(String),
}

// =============================================================================
// Store Errors
// =============================================================================

/// Errors raised by an artifact store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted database could not be decoded or encoded.
    #[error("corrupt database: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// A sentry write would grow the file past the size cap.
    #[error("sentry file would grow to {size} bytes")]
    SentryTooLarge {
        /// Size the write would produce.
        size: u64,
    },
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for artifact store operations.
pub type StoreResult<T> = Result<T, StoreError>;
