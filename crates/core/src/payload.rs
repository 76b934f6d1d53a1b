//! QR payload data model and wire format.
//!
//! A payload is a [`BasePayload`] plus up to three orthogonal layers. The
//! integrity layer is mandatory, the signature and encryption layers are
//! optional. Layers are merged into the flat wire object explicitly, and the
//! wire object is always written with the canonical encoder so the bytes
//! embedded in the QR image are reproducible.
//!
//! Scopes:
//!
//! - signature input: canonical bytes of the base payload
//! - HMAC input: canonical bytes of the base payload merged with the
//!   signature layer (when present)
//! - the encryption layer is applied last and covers neither

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::canonical;

/// Wire field names. Changing any of these changes the wire protocol.
pub mod fields {
    pub const TIMESTAMP: &str = "timestamp";
    pub const IDENTITY_HASH: &str = "identity_hash";
    pub const BLOCKCHAIN_HASHES: &str = "blockchain_hashes";
    pub const TIME_SERVER_VERIFICATION: &str = "time_server_verification";
    pub const USER_DATA: &str = "user_data";
    pub const SEQUENCE_NUMBER: &str = "sequence_number";

    pub const DIGITAL_SIGNATURE: &str = "digital_signature";
    pub const SIGNING_KEY_ID: &str = "signing_key_id";
    pub const SIGNATURE_ALGORITHM: &str = "signature_algorithm";

    pub const HMAC: &str = "_hmac";
    pub const HMAC_KEY_ID: &str = "_hmac_key_id";
    pub const HMAC_ALGORITHM: &str = "_hmac_algorithm";
    pub const INTEGRITY_CHECKED_AT: &str = "_integrity_checked_at";

    pub const ENCRYPTED_FIELDS: &str = "_encrypted_fields";
    pub const ENCRYPTION_KEY_ID: &str = "_encryption_key_id";
    pub const DATA_KEY_ID: &str = "_data_key_id";

    /// Fields owned by the signature layer.
    pub const SIGNATURE_LAYER: [&str; 3] = [DIGITAL_SIGNATURE, SIGNING_KEY_ID, SIGNATURE_ALGORITHM];

    /// Fields owned by the integrity layer.
    pub const INTEGRITY_LAYER: [&str; 4] =
        [HMAC, HMAC_KEY_ID, HMAC_ALGORITHM, INTEGRITY_CHECKED_AT];

    /// Fields owned by the encryption layer.
    pub const ENCRYPTION_LAYER: [&str; 3] = [ENCRYPTED_FIELDS, ENCRYPTION_KEY_ID, DATA_KEY_ID];
}

/// Returns true if `name` belongs to one of the protection layers.
pub fn is_layer_field(name: &str) -> bool {
    fields::SIGNATURE_LAYER.contains(&name)
        || fields::INTEGRITY_LAYER.contains(&name)
        || fields::ENCRYPTION_LAYER.contains(&name)
}

/// Parse a payload timestamp.
///
/// RFC 3339 with an offset is the wire form. ISO 8601 date-times without
/// an offset, such as `2025-01-11T15:30:45.123`, are read as UTC.
pub fn parse_timestamp(timestamp: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(timestamp) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Errors raised while building or decoding payloads.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Payload must be a JSON object")]
    NotAnObject,

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Missing integrity layer")]
    MissingIntegrityLayer,

    #[error("Incomplete {layer} layer: missing {field}")]
    IncompleteLayer { layer: String, field: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for payload operations.
pub type PayloadResult<T> = Result<T, PayloadError>;

/// The plain record produced once per generation tick.
///
/// Unknown wire members (e.g. an orchestrator-owned `format_version`) are kept
/// in `extensions` and are covered by the signature and HMAC like every other
/// base field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BasePayload {
    /// ISO-8601 / RFC 3339 generation time
    pub timestamp: String,
    /// Identity fingerprint of the producer
    pub identity_hash: String,
    /// Chain name to block hash
    pub blockchain_hashes: BTreeMap<String, String>,
    /// Time source attestation supplied by the time collaborator
    pub time_server_verification: Map<String, Value>,
    /// Optional user supplied data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Map<String, Value>>,
    /// Generation counter
    pub sequence_number: u64,
    /// Additional base members carried verbatim
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl BasePayload {
    pub fn new(timestamp: impl Into<String>, identity_hash: impl Into<String>, sequence_number: u64) -> Self {
        Self {
            timestamp: timestamp.into(),
            identity_hash: identity_hash.into(),
            sequence_number,
            ..Self::default()
        }
    }

    pub fn with_blockchain_hash(mut self, chain: impl Into<String>, hash: impl Into<String>) -> Self {
        self.blockchain_hashes.insert(chain.into(), hash.into());
        self
    }

    pub fn with_time_verification(mut self, verification: Map<String, Value>) -> Self {
        self.time_server_verification = verification;
        self
    }

    pub fn with_user_data(mut self, user_data: Map<String, Value>) -> Self {
        self.user_data = Some(user_data);
        self
    }

    /// Validates the structural requirements of a base payload.
    pub fn validate(&self) -> PayloadResult<()> {
        if self.timestamp.is_empty() {
            return Err(PayloadError::MissingField {
                field: fields::TIMESTAMP.to_string(),
            });
        }
        if parse_timestamp(&self.timestamp).is_none() {
            return Err(PayloadError::InvalidField {
                field: fields::TIMESTAMP.to_string(),
                reason: format!("not an ISO 8601 timestamp: {}", self.timestamp),
            });
        }
        if self.identity_hash.is_empty() {
            return Err(PayloadError::MissingField {
                field: fields::IDENTITY_HASH.to_string(),
            });
        }
        if let Some(name) = self.extensions.keys().find(|k| is_layer_field(k)) {
            return Err(PayloadError::InvalidField {
                field: name.clone(),
                reason: "reserved for a protection layer".to_string(),
            });
        }
        Ok(())
    }

    /// Field mapping of this payload.
    pub fn to_fields(&self) -> PayloadResult<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(PayloadError::NotAnObject),
        }
    }

    /// Rebuilds a payload from a field mapping. Absent members take their defaults.
    pub fn from_fields(fields: Map<String, Value>) -> PayloadResult<Self> {
        Ok(serde_json::from_value(Value::Object(fields))?)
    }

    /// Canonical bytes of the base payload (the signature input).
    pub fn canonical_bytes(&self) -> PayloadResult<Vec<u8>> {
        Ok(canonical::canonicalize(&self.to_fields()?))
    }

    /// Copy of this payload with the named members reset to their defaults.
    pub fn without_fields(&self, names: &[String]) -> PayloadResult<Self> {
        let mut map = self.to_fields()?;
        for name in names {
            map.remove(name);
        }
        Self::from_fields(map)
    }
}

/// Asymmetric signature annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureLayer {
    /// Hex-encoded signature bytes
    pub digital_signature: String,
    /// Key store identifier of the signing key
    pub signing_key_id: String,
    /// Algorithm identifier derived from the key
    pub signature_algorithm: String,
}

/// Mandatory HMAC annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityLayer {
    /// Hex-encoded tag
    #[serde(rename = "_hmac")]
    pub hmac: String,
    /// Identifier of the instance master key
    #[serde(rename = "_hmac_key_id")]
    pub key_id: String,
    /// `sha256` or `sha512`
    #[serde(rename = "_hmac_algorithm")]
    pub algorithm: String,
    /// RFC 3339 time the tag was computed
    #[serde(rename = "_integrity_checked_at")]
    pub checked_at: String,
}

/// Field encryption annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionLayer {
    /// Names of the base members replaced by ciphertext
    #[serde(rename = "_encrypted_fields")]
    pub encrypted_fields: Vec<String>,
    /// Identifier of the key wrapping the data key
    #[serde(rename = "_encryption_key_id")]
    pub encryption_key_id: String,
    /// Identifier of the per-payload data key
    #[serde(rename = "_data_key_id")]
    pub data_key_id: String,
    /// Ciphertext substituted for each encrypted member
    #[serde(skip)]
    pub sealed: BTreeMap<String, String>,
}

/// A base payload with its protection layers.
///
/// When `encryption` is present, the members it names are reset to their
/// defaults in `base` and their ciphertext lives in `EncryptionLayer::sealed`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnhancedPayload {
    pub base: BasePayload,
    pub signature: Option<SignatureLayer>,
    pub integrity: IntegrityLayer,
    pub encryption: Option<EncryptionLayer>,
}

impl EnhancedPayload {
    /// The HMAC scope: base members merged with the signature layer.
    pub fn integrity_scope(
        base: &BasePayload,
        signature: Option<&SignatureLayer>,
    ) -> PayloadResult<Map<String, Value>> {
        let mut map = base.to_fields()?;
        if let Some(layer) = signature {
            merge_layer(&mut map, layer)?;
        }
        Ok(map)
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// Base members as they appear on the wire, ciphertext included.
    pub fn wire_base_fields(&self) -> PayloadResult<Map<String, Value>> {
        let mut map = self.base.to_fields()?;
        if let Some(layer) = &self.encryption {
            for name in &layer.encrypted_fields {
                map.remove(name);
            }
            for (name, ciphertext) in &layer.sealed {
                map.insert(name.clone(), Value::String(ciphertext.clone()));
            }
        }
        Ok(map)
    }

    /// Flat wire object with every present layer merged in.
    pub fn to_wire_fields(&self) -> PayloadResult<Map<String, Value>> {
        let mut map = self.wire_base_fields()?;
        if let Some(layer) = &self.signature {
            merge_layer(&mut map, layer)?;
        }
        merge_layer(&mut map, &self.integrity)?;
        if let Some(layer) = &self.encryption {
            merge_layer(&mut map, layer)?;
        }
        Ok(map)
    }

    /// Canonical wire JSON, the exact text embedded in the QR image.
    pub fn to_wire_json(&self) -> PayloadResult<String> {
        Ok(canonical::to_canonical_string(&self.to_wire_fields()?))
    }

    pub fn from_wire_json(raw: &str) -> PayloadResult<Self> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| PayloadError::InvalidJson(e.to_string()))?;
        match value {
            Value::Object(map) => Self::from_wire_fields(map),
            _ => Err(PayloadError::NotAnObject),
        }
    }

    /// Splits a flat wire object back into base payload and layers.
    pub fn from_wire_fields(mut map: Map<String, Value>) -> PayloadResult<Self> {
        // Nulls never appear on the wire; treat them as absent.
        map.retain(|_, v| !v.is_null());

        let signature = if fields::SIGNATURE_LAYER.iter().any(|f| map.contains_key(*f)) {
            Some(SignatureLayer {
                digital_signature: take_string(&mut map, "signature", fields::DIGITAL_SIGNATURE)?,
                signing_key_id: take_string(&mut map, "signature", fields::SIGNING_KEY_ID)?,
                signature_algorithm: take_string(&mut map, "signature", fields::SIGNATURE_ALGORITHM)?,
            })
        } else {
            None
        };

        if !map.contains_key(fields::HMAC) {
            return Err(PayloadError::MissingIntegrityLayer);
        }
        let integrity = IntegrityLayer {
            hmac: take_string(&mut map, "integrity", fields::HMAC)?,
            key_id: take_string(&mut map, "integrity", fields::HMAC_KEY_ID)?,
            algorithm: take_string(&mut map, "integrity", fields::HMAC_ALGORITHM)?,
            checked_at: take_string(&mut map, "integrity", fields::INTEGRITY_CHECKED_AT)?,
        };

        let encryption = if fields::ENCRYPTION_LAYER.iter().any(|f| map.contains_key(*f)) {
            let encrypted_fields = take_string_list(&mut map, fields::ENCRYPTED_FIELDS)?;
            let encryption_key_id = take_string(&mut map, "encryption", fields::ENCRYPTION_KEY_ID)?;
            let data_key_id = take_string(&mut map, "encryption", fields::DATA_KEY_ID)?;

            let mut sealed = BTreeMap::new();
            for name in &encrypted_fields {
                if is_layer_field(name) {
                    return Err(PayloadError::InvalidField {
                        field: name.clone(),
                        reason: "layer fields cannot be encrypted".to_string(),
                    });
                }
                match map.remove(name) {
                    Some(Value::String(ciphertext)) => {
                        sealed.insert(name.clone(), ciphertext);
                    }
                    Some(_) => {
                        return Err(PayloadError::InvalidField {
                            field: name.clone(),
                            reason: "encrypted value must be a string".to_string(),
                        })
                    }
                    None => {
                        return Err(PayloadError::MissingField { field: name.clone() });
                    }
                }
            }

            Some(EncryptionLayer {
                encrypted_fields,
                encryption_key_id,
                data_key_id,
                sealed,
            })
        } else {
            None
        };

        let base = BasePayload::from_fields(map)?;

        Ok(Self {
            base,
            signature,
            integrity,
            encryption,
        })
    }
}

fn merge_layer<T: Serialize>(map: &mut Map<String, Value>, layer: &T) -> PayloadResult<()> {
    match serde_json::to_value(layer)? {
        Value::Object(layer_fields) => {
            map.extend(layer_fields);
            Ok(())
        }
        _ => Err(PayloadError::NotAnObject),
    }
}

fn take_string(map: &mut Map<String, Value>, layer: &str, field: &str) -> PayloadResult<String> {
    match map.remove(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(PayloadError::InvalidField {
            field: field.to_string(),
            reason: "must be a string".to_string(),
        }),
        None => Err(PayloadError::IncompleteLayer {
            layer: layer.to_string(),
            field: field.to_string(),
        }),
    }
}

fn take_string_list(map: &mut Map<String, Value>, field: &str) -> PayloadResult<Vec<String>> {
    let invalid = || PayloadError::InvalidField {
        field: field.to_string(),
        reason: "must be a list of field names".to_string(),
    };
    match map.remove(field) {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                _ => Err(invalid()),
            })
            .collect(),
        Some(_) => Err(invalid()),
        None => Err(PayloadError::IncompleteLayer {
            layer: "encryption".to_string(),
            field: field.to_string(),
        }),
    }
}
