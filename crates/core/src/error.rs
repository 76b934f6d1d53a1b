//! Core error types

use thiserror::Error;

/// Core error type for the QR Live Protocol
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration could not be parsed or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Canonical encoding failed
    #[error("Canonicalization error: {0}")]
    Canonicalization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
