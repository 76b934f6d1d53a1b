//! Cryptographic layers for the QR Live Protocol (QRLP).
//!
//! This crate provides the key store and the three protection layers the
//! payload pipeline composes: digital signatures, HMAC integrity tags and
//! field-level encryption.
//!
//! # Core Capabilities
//!
//! - **Key Management**: generation, wrapped storage, export, import and
//!   snapshots of RSA and ECDSA key pairs
//! - **Digital Signatures**: RSA-PSS/SHA-256 and ECDSA over P-256, P-384 or
//!   P-521, all with SHA-256
//! - **Integrity**: HMAC-SHA256 or HMAC-SHA512 under an instance master key
//! - **Confidentiality**: AES-256-GCM per-field encryption with per-payload
//!   data keys
//!
//! # Security Principles
//!
//! - Private keys are stored encrypted and decrypted only for one operation
//! - Secrets are zeroized on drop and never logged
//! - Tag and signature checks never short-circuit on malformed input

pub mod aead;
pub mod encryption;
pub mod integrity;
pub mod keystore;
pub mod material;
pub mod secret;
pub mod signing;

pub use encryption::{DecryptionError, EncryptionError, FieldEncryptor, SealedFields};
pub use integrity::{IntegrityError, IntegrityTag, IntegrityTagger};
pub use keystore::{KeyRecord, KeyStore, KeyStoreError, KeyStoreSnapshot, PublicKeyFormat, SnapshotEntry};
pub use material::{KeySpec, PrivateKeyMaterial, PublicKeyMaterial};
pub use secret::SecretKey32;
pub use signing::{
    verify_signature, SignatureAlgorithm, SignatureResult, Signer, SigningError, SigningMetrics,
    VerificationMetrics, Verifier,
};
