//! Error types for the Kibana auth gateway

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors raised outside of a single request (startup, serving)
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP client construction error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a bounded call to an external service (user directory or
/// backend login).
///
/// `Timeout` and `Transport` never carry a response; `Status` means the
/// service answered, but not with the status the caller needed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The call did not complete before its deadline and was cancelled
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Network-level fault: refused, reset, DNS, TLS, protocol
    #[error("Transport error: {0}")]
    Transport(String),

    /// The service answered with an unexpected status
    #[error("Unexpected status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, kept for server-side diagnostics only
        body: String,
    },

    /// A request URL could not be built from the configured target
    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
