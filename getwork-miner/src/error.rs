//! Common error types for getwork-miner.
//!
//! This module provides a centralized Error enum using thiserror for the
//! daemon's setup path. Protocol-level failures have their own taxonomy in
//! [`crate::getwork::GetworkError`] and never leave the protocol client;
//! the application sees them as events.

use thiserror::Error;

/// Main error type for getwork-miner operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
