//! AES-256-GCM sealing used for key wrapping and field encryption.
//!
//! Sealed form is `nonce || ciphertext || tag`. Every call draws a fresh
//! random 96-bit nonce.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::secret::SecretKey32;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AeadError {
    #[error("Invalid key length")]
    InvalidKey,

    #[error("Encryption failed")]
    Encryption,

    #[error("Sealed data too short: {0} bytes")]
    Truncated(usize),

    #[error("Authentication tag mismatch")]
    Authentication,
}

fn cipher(key: &SecretKey32) -> Result<Aes256Gcm, AeadError> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| AeadError::InvalidKey)
}

/// Encrypt `plaintext` under `key`, authenticating `aad` alongside it.
pub fn seal(key: &SecretKey32, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, AeadError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher(key)?
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::Encryption)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Reverse of [`seal`]. Any tag failure is an error; no plaintext escapes.
pub fn open(key: &SecretKey32, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, AeadError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(AeadError::Truncated(sealed.len()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

    cipher(key)?
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError::Authentication)
}
