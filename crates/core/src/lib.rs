//! Core functionality for the QR Live Protocol (QRLP).
//!
//! This crate provides the payload data model, the canonical byte encoding
//! every signature and HMAC is computed over, verification result types,
//! configuration and logging shared across the QRLP workspace.

pub mod canonical;
pub mod config;
pub mod error;
pub mod logging;
pub mod payload;
pub mod types;
pub mod verification;

pub use canonical::{canonicalize, canonicalize_then_parse, canonicalize_value, to_canonical_bytes};
pub use config::{
    EncryptionConfig, GenerationConfig, IntegrityConfig, PipelineConfig, SigningConfig,
    VerificationConfig, MIN_ECDSA_BITS, MIN_RSA_BITS,
};
pub use error::{CoreError, Result};
pub use payload::{
    fields, is_layer_field, parse_timestamp, BasePayload, EncryptionLayer, EnhancedPayload, IntegrityLayer,
    PayloadError, PayloadResult, SignatureLayer,
};
pub use types::{HmacAlgorithm, KeyAlgorithm};
pub use verification::{VerificationContext, VerificationResult};
