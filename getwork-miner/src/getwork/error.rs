//! Error types for the getwork protocol.

use thiserror::Error;

/// Getwork protocol errors.
///
/// Every variant except [`GetworkError::Disconnected`] tears down the
/// connection that produced it, so the next exchange starts on a fresh
/// socket.
#[derive(Error, Debug)]
pub enum GetworkError {
    /// Coordinator answered 401
    #[error("Authorization failed")]
    Unauthorized,

    /// Coordinator returned a JSON-RPC `error.message`
    #[error("{0}")]
    ServerMessage(String),

    /// Socket reset, refused connection, malformed HTTP
    #[error("Transport error: {0}")]
    Transport(String),

    /// Timeout waiting for response
    #[error("Timeout waiting for response")]
    Timeout,

    /// Redirect chain exceeded the follow limit
    #[error("Too many redirects")]
    TooManyRedirects,

    /// Response body was not the expected JSON-RPC shape
    #[error("Invalid response: {0}")]
    Parse(String),

    /// JSON parsing or serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid URL (e.g. a bad long-poll advertisement)
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The client or connection went away before completing
    #[error("Connection lost")]
    Disconnected,
}

impl GetworkError {
    /// Whether the coordinator itself reported this failure, as opposed to
    /// the network or a malformed response.
    pub fn is_server_message(&self) -> bool {
        matches!(self, GetworkError::ServerMessage(_))
    }

    /// Whether the exchange worked but the body was not usable.
    pub fn is_malformed(&self) -> bool {
        matches!(self, GetworkError::Parse(_) | GetworkError::Json(_))
    }
}

/// Convenient Result type for getwork operations.
pub type GetworkResult<T> = Result<T, GetworkError>;
