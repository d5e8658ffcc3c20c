//! Error types for the HTTP layer.

use thiserror::Error;

/// Errors that can occur while executing web requests.
#[derive(Debug, Error)]
pub enum WebError {
    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    /// A request URL could not be parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The server answered with a 4xx status.
    #[error("{url} rejected the request with status {status}")]
    ClientError {
        /// HTTP status code.
        status: u16,
        /// The URL that was requested.
        url: String,
    },

    /// Every attempt failed at the transport level, with a 5xx status or
    /// with a body that could not be read or decoded.
    #[error("request to {url} failed {tries} times")]
    TooManyTries {
        /// Attempts made.
        tries: u8,
        /// The URL that was requested.
        url: String,
    },
}

impl WebError {
    /// Returns `true` for a 4xx rejection.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::ClientError { .. })
    }
}

/// Result type for web requests.
pub type WebResult<T> = Result<T, WebError>;
