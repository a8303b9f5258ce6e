//! Error types for the remote API client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure (connect, timeout, TLS, ...).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Body was not the expected JSON envelope.
    #[error("malformed response body: {0}")]
    MalformedBody(String),

    /// A result set or column the procedure contract requires is missing.
    #[error("procedure {procedure}: {detail}")]
    Contract { procedure: String, detail: String },

    /// No cached session and the caller supplied no token.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}
