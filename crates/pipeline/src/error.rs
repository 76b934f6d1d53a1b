//! Error types for QRLP pipeline operations.

use qrlive_core::PayloadError;
use qrlive_crypto::{DecryptionError, EncryptionError, IntegrityError};
use thiserror::Error;

/// Errors that can occur in pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// HMAC tagging failed; no payload may be emitted without a tag
    #[error("Integrity tagging failed: {0}")]
    Integrity(#[from] IntegrityError),

    /// Base payload rejected or wire form could not be built
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    /// Field encryption failed during enhance
    #[error("Encryption failed: {0}")]
    Encryption(#[from] EncryptionError),

    /// Encrypted fields could not be recovered
    #[error("Decryption failed: {0}")]
    Decryption(#[from] DecryptionError),

    /// Inconsistent pipeline configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Live generation lifecycle errors
    #[error("Generator error: {0}")]
    Generator(String),
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
