//! HMAC integrity tagging.
//!
//! The master key is a symmetric secret owned by one pipeline instance and
//! injected at construction. It is immutable afterwards, so tagging and
//! checking need no lock and may run concurrently.

use hmac::{Hmac, Mac};
use qrlive_core::HmacAlgorithm;
use sha2::{Sha256, Sha512};
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::secret::{random_key_id, SecretKey32};

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("Invalid HMAC key: {0}")]
    InvalidKey(String),

    #[error("HMAC computation failed: {0}")]
    Crypto(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityTag {
    pub tag: Vec<u8>,
    pub key_id: String,
    pub algorithm: HmacAlgorithm,
}

impl IntegrityTag {
    pub fn to_hex(&self) -> String {
        hex::encode(&self.tag)
    }
}

pub struct IntegrityTagger {
    master_key: SecretKey32,
    key_id: String,
    algorithm: HmacAlgorithm,
}

impl IntegrityTagger {
    /// Tagger with a fresh random master key.
    pub fn new(algorithm: HmacAlgorithm) -> Self {
        Self::with_master_key(SecretKey32::random(), algorithm)
    }

    pub fn with_master_key(master_key: SecretKey32, algorithm: HmacAlgorithm) -> Self {
        Self::with_master_key_id(master_key, random_key_id(), algorithm)
    }

    /// Tagger for a master key shared under a known id, so several instances
    /// can check each other's tags.
    pub fn with_master_key_id(master_key: SecretKey32, key_id: impl Into<String>, algorithm: HmacAlgorithm) -> Self {
        Self {
            master_key,
            key_id: key_id.into(),
            algorithm,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn algorithm(&self) -> HmacAlgorithm {
        self.algorithm
    }

    pub fn tag(&self, message: &[u8]) -> Result<IntegrityTag, IntegrityError> {
        let tag = match self.algorithm {
            HmacAlgorithm::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(self.master_key.as_bytes())
                    .map_err(|e| IntegrityError::InvalidKey(e.to_string()))?;
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
            HmacAlgorithm::Sha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(self.master_key.as_bytes())
                    .map_err(|e| IntegrityError::InvalidKey(e.to_string()))?;
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
        };

        if tag.len() != self.algorithm.tag_len() {
            return Err(IntegrityError::Crypto(format!(
                "unexpected tag length {}",
                tag.len()
            )));
        }

        Ok(IntegrityTag {
            tag,
            key_id: self.key_id.clone(),
            algorithm: self.algorithm,
        })
    }

    /// Constant-time check of `tag` over `message`.
    ///
    /// A foreign `key_id` fails, but only after the full comparison ran.
    pub fn check(&self, message: &[u8], tag: &[u8], key_id: &str) -> bool {
        let tag_matches = match self.algorithm {
            HmacAlgorithm::Sha256 => Hmac::<Sha256>::new_from_slice(self.master_key.as_bytes())
                .map(|mut mac| {
                    mac.update(message);
                    mac.verify_slice(tag).is_ok()
                })
                .unwrap_or(false),
            HmacAlgorithm::Sha512 => Hmac::<Sha512>::new_from_slice(self.master_key.as_bytes())
                .map(|mut mac| {
                    mac.update(message);
                    mac.verify_slice(tag).is_ok()
                })
                .unwrap_or(false),
        };

        let verified = tag_matches & (key_id == self.key_id);
        if !verified {
            debug!(key_id, expected_key_id = %self.key_id, "HMAC check failed");
        }
        verified
    }
}

impl fmt::Debug for IntegrityTagger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrityTagger")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}
