//! Field-level AES-256-GCM encryption with per-payload data keys.
//!
//! Each [`FieldEncryptor::encrypt_fields`] call draws a fresh data key,
//! seals every named field with it and stores the data key wrapped under
//! the encryptor's long-lived key, indexed by a new `data_key_id`. Field
//! ciphertexts carry `qr_field_<name>` as associated data so they cannot be
//! moved between fields; wrapped data keys are bound to their id.
//!
//! The wrapped key ring is bounded; the oldest data key is evicted first.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use qrlive_core::canonicalize_value;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::aead;
use crate::secret::{random_key_id, SecretKey32};

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("Encryption of field '{field}' failed: {reason}")]
    Seal { field: String, reason: String },

    #[error("Data key wrapping failed: {0}")]
    KeyWrap(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("Unknown data key: {0}")]
    UnknownDataKey(String),

    #[error("Authentication tag mismatch for field '{field}'")]
    TagMismatch { field: String },

    #[error("Malformed ciphertext for field '{field}': {reason}")]
    MalformedCiphertext { field: String, reason: String },

    #[error("Failed to unwrap data key {0}")]
    KeyUnwrap(String),
}

/// Output of [`FieldEncryptor::encrypt_fields`].
#[derive(Debug, Clone)]
pub struct SealedFields {
    /// Input fields with each encrypted value replaced by base64 ciphertext
    pub fields: Map<String, Value>,
    /// Names actually encrypted, in request order
    pub encrypted_fields: Vec<String>,
    pub data_key_id: String,
    pub encryption_key_id: String,
}

#[derive(Default)]
struct DataKeyRing {
    wrapped: HashMap<String, Vec<u8>>,
    order: VecDeque<String>,
}

pub struct FieldEncryptor {
    wrapping_key: SecretKey32,
    key_id: String,
    max_data_keys: usize,
    ring: RwLock<DataKeyRing>,
}

fn field_aad(field: &str) -> Vec<u8> {
    format!("qr_field_{}", field).into_bytes()
}

impl FieldEncryptor {
    pub fn new(max_data_keys: usize) -> Self {
        Self::with_wrapping_key(SecretKey32::random(), random_key_id(), max_data_keys)
    }

    pub fn with_wrapping_key(wrapping_key: SecretKey32, key_id: impl Into<String>, max_data_keys: usize) -> Self {
        Self {
            wrapping_key,
            key_id: key_id.into(),
            max_data_keys: max_data_keys.max(1),
            ring: RwLock::new(DataKeyRing::default()),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn data_key_count(&self) -> usize {
        self.ring.read().unwrap_or_else(PoisonError::into_inner).wrapped.len()
    }

    /// Encrypt each field in `names` present (and non-null) in `fields`.
    ///
    /// Absent names are skipped, so the sealed set may be empty.
    pub fn encrypt_fields(&self, fields: &Map<String, Value>, names: &[String]) -> Result<SealedFields, EncryptionError> {
        let data_key = SecretKey32::random();
        let data_key_id = Uuid::new_v4().to_string();

        let mut output = fields.clone();
        let mut encrypted_fields = Vec::new();
        for name in names {
            if encrypted_fields.contains(name) {
                continue;
            }
            let Some(value) = fields.get(name).filter(|v| !v.is_null()) else {
                continue;
            };
            let sealed = aead::seal(&data_key, &canonicalize_value(value), &field_aad(name)).map_err(|e| {
                EncryptionError::Seal {
                    field: name.clone(),
                    reason: e.to_string(),
                }
            })?;
            output.insert(name.clone(), Value::String(STANDARD.encode(sealed)));
            encrypted_fields.push(name.clone());
        }

        // Nothing sealed, nothing to decrypt later
        if !encrypted_fields.is_empty() {
            let wrapped = aead::seal(&self.wrapping_key, data_key.as_bytes(), data_key_id.as_bytes())
                .map_err(|e| EncryptionError::KeyWrap(e.to_string()))?;
            self.store_data_key(data_key_id.clone(), wrapped);
        }

        debug!(data_key_id = %data_key_id, fields = ?encrypted_fields, "Encrypted payload fields");
        Ok(SealedFields {
            fields: output,
            encrypted_fields,
            data_key_id,
            encryption_key_id: self.key_id.clone(),
        })
    }

    fn store_data_key(&self, data_key_id: String, wrapped: Vec<u8>) {
        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        while ring.order.len() >= self.max_data_keys {
            match ring.order.pop_front() {
                Some(evicted) => {
                    ring.wrapped.remove(&evicted);
                    debug!(data_key_id = %evicted, "Evicted data key");
                }
                None => break,
            }
        }
        ring.order.push_back(data_key_id.clone());
        ring.wrapped.insert(data_key_id, wrapped);
    }

    /// Decrypt `names` in `fields` with the data key `data_key_id`.
    ///
    /// All-or-nothing: any failure returns an error and no plaintext.
    pub fn decrypt_fields(
        &self,
        fields: &Map<String, Value>,
        names: &[String],
        data_key_id: &str,
    ) -> Result<Map<String, Value>, DecryptionError> {
        if names.is_empty() {
            return Ok(fields.clone());
        }

        let wrapped = self
            .ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .wrapped
            .get(data_key_id)
            .cloned()
            .ok_or_else(|| DecryptionError::UnknownDataKey(data_key_id.to_string()))?;

        let data_key = aead::open(&self.wrapping_key, &wrapped, data_key_id.as_bytes())
            .ok()
            .and_then(|bytes| SecretKey32::from_slice(&Zeroizing::new(bytes)))
            .ok_or_else(|| DecryptionError::KeyUnwrap(data_key_id.to_string()))?;

        let mut output = fields.clone();
        for name in names {
            let malformed = |reason: &str| DecryptionError::MalformedCiphertext {
                field: name.clone(),
                reason: reason.to_string(),
            };
            let encoded = fields
                .get(name)
                .and_then(Value::as_str)
                .ok_or_else(|| malformed("missing or not a string"))?;
            let sealed = STANDARD.decode(encoded).map_err(|_| malformed("invalid base64"))?;
            let plaintext = aead::open(&data_key, &sealed, &field_aad(name)).map_err(|e| match e {
                aead::AeadError::Truncated(_) => malformed("truncated"),
                _ => DecryptionError::TagMismatch { field: name.clone() },
            })?;
            let plaintext = Zeroizing::new(plaintext);
            let value: Value = serde_json::from_slice(&plaintext).map_err(|_| malformed("plaintext is not JSON"))?;
            output.insert(name.clone(), value);
        }

        Ok(output)
    }

    /// Drop a data key so its payloads can no longer be decrypted here.
    pub fn forget_data_key(&self, data_key_id: &str) -> bool {
        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        ring.order.retain(|id| id != data_key_id);
        let removed = ring.wrapped.remove(data_key_id).is_some();
        if removed {
            warn!(data_key_id, "Data key forgotten");
        }
        removed
    }
}

impl fmt::Debug for FieldEncryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldEncryptor")
            .field("key_id", &self.key_id)
            .field("max_data_keys", &self.max_data_keys)
            .finish_non_exhaustive()
    }
}
