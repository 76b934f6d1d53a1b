//! Asymmetric key lifecycle.
//!
//! Private material is held only as AES-256-GCM ciphertext under a
//! store-level wrapping key, bound to its key id as associated data. It is
//! decrypted on demand by [`KeyStore::get_private_key`] and the plaintext is
//! handed to the caller in a zeroizing container; nothing is cached.
//!
//! Public-only records (imported verification keys) have no private half.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use qrlive_core::KeyAlgorithm;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::aead;
use crate::material::{self, KeySpec, PrivateKeyMaterial, PublicKeyMaterial};
use crate::secret::SecretKey32;

/// Current [`KeyStoreSnapshot`] format.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Failed to decrypt private key {0}")]
    KeyDecryption(String),

    #[error("Invalid key spec: {0}")]
    InvalidKeySpec(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Key {0} has no private material")]
    PublicKeyOnly(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KeyStoreError>;

/// Key metadata. Never carries private material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: String,
    pub algorithm: KeyAlgorithm,
    pub key_size: u32,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    /// Number of private-key retrievals. Monotonic.
    pub usage_count: u64,
    pub public_material: PublicKeyMaterial,
    /// False for imported verification keys
    pub has_private_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicKeyFormat {
    Pem,
    Der,
    Json,
}

#[derive(Serialize)]
struct PublicKeyExport<'a> {
    key_id: &'a str,
    algorithm: KeyAlgorithm,
    key_size: u32,
    public_key: String,
    created_at: DateTime<Utc>,
}

/// Serializable store contents. Private material stays wrapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyStoreSnapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub keys: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub record: KeyRecord,
    /// base64 of `nonce || ciphertext || tag`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_private_key: Option<String>,
}

struct StoredKey {
    record: KeyRecord,
    wrapped_private_key: Option<Vec<u8>>,
}

/// Thread-safe asymmetric key store.
pub struct KeyStore {
    wrapping_key: SecretKey32,
    keys: RwLock<HashMap<String, StoredKey>>,
}

impl KeyStore {
    /// Empty store with a fresh random wrapping key.
    pub fn new() -> Self {
        Self::with_wrapping_key(SecretKey32::random())
    }

    pub fn with_wrapping_key(wrapping_key: SecretKey32) -> Self {
        Self {
            wrapping_key,
            keys: RwLock::new(HashMap::new()),
        }
    }

    // Writers never leave a record half-updated, so poisoning is ignored.
    fn read_keys(&self) -> RwLockReadGuard<'_, HashMap<String, StoredKey>> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_keys(&self) -> RwLockWriteGuard<'_, HashMap<String, StoredKey>> {
        self.keys.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generate a key pair and return its id.
    ///
    /// RSA accepts 2048, 3072 and 4096 bits; ECDSA accepts 256 (P-256) and
    /// 384 (P-384). Anything below the floor is [`KeyStoreError::InvalidKeySpec`].
    pub fn generate_keypair(&self, algorithm: KeyAlgorithm, key_size: u32, purpose: &str) -> Result<String> {
        let spec = KeySpec::new(algorithm, key_size)?;
        // Key generation runs outside the lock
        let (public, private) = material::generate(spec)?;
        let key_id = public.fingerprint();

        let wrapped = aead::seal(&self.wrapping_key, private.der(), key_id.as_bytes())
            .map_err(|e| KeyStoreError::KeyGeneration(format!("wrapping failed: {}", e)))?;

        let record = KeyRecord {
            key_id: key_id.clone(),
            algorithm,
            key_size,
            purpose: purpose.to_string(),
            created_at: Utc::now(),
            last_used: None,
            usage_count: 0,
            public_material: public,
            has_private_key: true,
        };

        self.write_keys().insert(
            key_id.clone(),
            StoredKey {
                record,
                wrapped_private_key: Some(wrapped),
            },
        );

        info!(key_id = %key_id, algorithm = %algorithm, key_size, purpose, "Generated key pair");
        Ok(key_id)
    }

    /// Register a public key distributed out of band so signatures made with
    /// it can be verified here.
    ///
    /// `key_id` must be the fingerprint of the material, which is how the
    /// producing store named it.
    pub fn import_public_key(&self, key_id: &str, public: PublicKeyMaterial, purpose: &str) -> Result<()> {
        public.parse()?;
        if public.fingerprint() != key_id {
            return Err(KeyStoreError::InvalidKeySpec(format!(
                "key id {} does not match public key fingerprint",
                key_id
            )));
        }

        let mut keys = self.write_keys();
        if keys.contains_key(key_id) {
            debug!(key_id, "Public key already present");
            return Ok(());
        }
        keys.insert(
            key_id.to_string(),
            StoredKey {
                record: KeyRecord {
                    key_id: key_id.to_string(),
                    algorithm: public.algorithm,
                    key_size: public.key_size,
                    purpose: purpose.to_string(),
                    created_at: Utc::now(),
                    last_used: None,
                    usage_count: 0,
                    public_material: public,
                    has_private_key: false,
                },
                wrapped_private_key: None,
            },
        );

        info!(key_id, purpose, "Imported public key");
        Ok(())
    }

    pub fn get_public_key(&self, key_id: &str) -> Result<PublicKeyMaterial> {
        self.read_keys()
            .get(key_id)
            .map(|stored| stored.record.public_material.clone())
            .ok_or_else(|| KeyStoreError::KeyNotFound(key_id.to_string()))
    }

    /// Decrypt the private key for one operation. Counts as a use.
    pub fn get_private_key(&self, key_id: &str) -> Result<PrivateKeyMaterial> {
        let (algorithm, key_size, wrapped) = {
            let mut keys = self.write_keys();
            let stored = keys
                .get_mut(key_id)
                .ok_or_else(|| KeyStoreError::KeyNotFound(key_id.to_string()))?;
            let wrapped = stored
                .wrapped_private_key
                .clone()
                .ok_or_else(|| KeyStoreError::PublicKeyOnly(key_id.to_string()))?;
            stored.record.usage_count += 1;
            stored.record.last_used = Some(Utc::now());
            (stored.record.algorithm, stored.record.key_size, wrapped)
        };

        let der = aead::open(&self.wrapping_key, &wrapped, key_id.as_bytes()).map_err(|e| {
            warn!(key_id, error = %e, "Private key unwrap failed");
            KeyStoreError::KeyDecryption(key_id.to_string())
        })?;

        Ok(PrivateKeyMaterial::new(algorithm, key_size, Zeroizing::new(der)))
    }

    pub fn get_key_info(&self, key_id: &str) -> Result<KeyRecord> {
        self.read_keys()
            .get(key_id)
            .map(|stored| stored.record.clone())
            .ok_or_else(|| KeyStoreError::KeyNotFound(key_id.to_string()))
    }

    /// All key records, oldest first.
    pub fn list_keys(&self) -> Vec<KeyRecord> {
        let mut records: Vec<KeyRecord> = self.read_keys().values().map(|s| s.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key_id.cmp(&b.key_id)));
        records
    }

    /// Newest key with private material registered for `purpose`.
    pub fn find_signing_key(&self, purpose: &str) -> Option<KeyRecord> {
        self.read_keys()
            .values()
            .filter(|s| s.record.has_private_key && s.record.purpose == purpose)
            .max_by(|a, b| a.record.created_at.cmp(&b.record.created_at))
            .map(|s| s.record.clone())
    }

    pub fn contains(&self, key_id: &str) -> bool {
        self.read_keys().contains_key(key_id)
    }

    pub fn delete_key(&self, key_id: &str) -> bool {
        let removed = self.write_keys().remove(key_id).is_some();
        if removed {
            info!(key_id, "Deleted key");
        }
        removed
    }

    pub fn export_public_key(&self, key_id: &str, format: PublicKeyFormat) -> Result<Vec<u8>> {
        let record = self.get_key_info(key_id)?;
        match format {
            PublicKeyFormat::Der => Ok(record.public_material.der),
            PublicKeyFormat::Pem => Ok(record.public_material.to_pem()?.into_bytes()),
            PublicKeyFormat::Json => {
                let export = PublicKeyExport {
                    key_id: &record.key_id,
                    algorithm: record.algorithm,
                    key_size: record.key_size,
                    public_key: STANDARD.encode(&record.public_material.der),
                    created_at: record.created_at,
                };
                serde_json::to_vec(&export).map_err(|e| KeyStoreError::Serialization(e.to_string()))
            }
        }
    }

    pub fn snapshot(&self) -> KeyStoreSnapshot {
        let mut keys: Vec<SnapshotEntry> = self
            .read_keys()
            .values()
            .map(|stored| SnapshotEntry {
                record: stored.record.clone(),
                wrapped_private_key: stored.wrapped_private_key.as_ref().map(|w| STANDARD.encode(w)),
            })
            .collect();
        keys.sort_by(|a, b| a.record.key_id.cmp(&b.record.key_id));
        KeyStoreSnapshot {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            keys,
        }
    }

    /// Rebuild a store from a snapshot taken under the same wrapping key.
    ///
    /// Every wrapped private key is test-opened so a wrong wrapping key fails
    /// here rather than at the first signature.
    pub fn from_snapshot(snapshot: KeyStoreSnapshot, wrapping_key: SecretKey32) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(KeyStoreError::Serialization(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut keys = HashMap::with_capacity(snapshot.keys.len());
        for entry in snapshot.keys {
            let key_id = entry.record.key_id.clone();
            let wrapped = match entry.wrapped_private_key {
                Some(encoded) => {
                    let wrapped = STANDARD
                        .decode(encoded)
                        .map_err(|e| KeyStoreError::Serialization(format!("{}: {}", key_id, e)))?;
                    aead::open(&wrapping_key, &wrapped, key_id.as_bytes())
                        .map(Zeroizing::new)
                        .map_err(|_| KeyStoreError::KeyDecryption(key_id.clone()))?;
                    Some(wrapped)
                }
                None => None,
            };
            let record = KeyRecord {
                has_private_key: wrapped.is_some(),
                ..entry.record
            };
            keys.insert(
                key_id,
                StoredKey {
                    record,
                    wrapped_private_key: wrapped,
                },
            );
        }

        info!(keys = keys.len(), "Restored key store snapshot");
        Ok(Self {
            wrapping_key,
            keys: RwLock::new(keys),
        })
    }

    pub fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.snapshot())
            .map_err(|e| KeyStoreError::Serialization(e.to_string()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load_snapshot<P: AsRef<Path>>(path: P, wrapping_key: SecretKey32) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let snapshot: KeyStoreSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| KeyStoreError::Serialization(e.to_string()))?;
        Self::from_snapshot(snapshot, wrapping_key)
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ecdsa_key(store: &KeyStore) -> String {
        store.generate_keypair(KeyAlgorithm::Ecdsa, 256, "qr_signing").unwrap()
    }

    #[test]
    fn test_generate_and_fetch() {
        let store = KeyStore::new();
        let key_id = ecdsa_key(&store);

        let public = store.get_public_key(&key_id).unwrap();
        assert_eq!(public.fingerprint(), key_id);

        let private = store.get_private_key(&key_id).unwrap();
        assert_eq!(private.algorithm, KeyAlgorithm::Ecdsa);
        assert!(!private.der().is_empty());
    }

    #[test]
    fn test_rejects_small_keys() {
        let store = KeyStore::new();
        assert!(matches!(
            store.generate_keypair(KeyAlgorithm::Rsa, 1024, "x"),
            Err(KeyStoreError::InvalidKeySpec(_))
        ));
        assert!(store.list_keys().is_empty());
    }

    #[test]
    fn test_rsa_keypair() {
        let store = KeyStore::new();
        let key_id = store.generate_keypair(KeyAlgorithm::Rsa, 2048, "qr_signing").unwrap();
        let record = store.get_key_info(&key_id).unwrap();
        assert_eq!(record.algorithm, KeyAlgorithm::Rsa);
        assert_eq!(record.key_size, 2048);
        assert!(store.export_public_key(&key_id, PublicKeyFormat::Pem).is_ok());
    }

    #[test]
    fn test_missing_key() {
        let store = KeyStore::new();
        assert!(matches!(store.get_public_key("nope"), Err(KeyStoreError::KeyNotFound(_))));
        assert!(matches!(store.get_private_key("nope"), Err(KeyStoreError::KeyNotFound(_))));
    }

    #[test]
    fn test_usage_count_increments() {
        let store = KeyStore::new();
        let key_id = ecdsa_key(&store);
        assert_eq!(store.get_key_info(&key_id).unwrap().usage_count, 0);

        store.get_private_key(&key_id).unwrap();
        store.get_private_key(&key_id).unwrap();
        let record = store.get_key_info(&key_id).unwrap();
        assert_eq!(record.usage_count, 2);
        assert!(record.last_used.is_some());

        // Public lookups are not uses
        store.get_public_key(&key_id).unwrap();
        assert_eq!(store.get_key_info(&key_id).unwrap().usage_count, 2);
    }

    #[test]
    fn test_concurrent_usage_is_counted() {
        let store = Arc::new(KeyStore::new());
        let key_id = ecdsa_key(&store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let key_id = key_id.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        store.get_private_key(&key_id).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get_key_info(&key_id).unwrap().usage_count, 80);
    }

    #[test]
    fn test_list_keys_has_no_private_material() {
        let store = KeyStore::new();
        ecdsa_key(&store);
        store.generate_keypair(KeyAlgorithm::Ecdsa, 384, "audit").unwrap();

        let listed = store.list_keys();
        assert_eq!(listed.len(), 2);
        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains("wrapped"));
        assert!(!json.contains("PRIVATE"));
    }

    #[test]
    fn test_find_signing_key_by_purpose() {
        let store = KeyStore::new();
        assert!(store.find_signing_key("qr_signing").is_none());
        let key_id = ecdsa_key(&store);
        store.generate_keypair(KeyAlgorithm::Ecdsa, 256, "other").unwrap();
        assert_eq!(store.find_signing_key("qr_signing").unwrap().key_id, key_id);
    }

    #[test]
    fn test_delete_key() {
        let store = KeyStore::new();
        let key_id = ecdsa_key(&store);
        assert!(store.delete_key(&key_id));
        assert!(!store.delete_key(&key_id));
        assert!(!store.contains(&key_id));
    }

    #[test]
    fn test_export_formats() {
        let store = KeyStore::new();
        let key_id = ecdsa_key(&store);

        let der = store.export_public_key(&key_id, PublicKeyFormat::Der).unwrap();
        assert_eq!(der, store.get_public_key(&key_id).unwrap().der);

        let pem = String::from_utf8(store.export_public_key(&key_id, PublicKeyFormat::Pem).unwrap()).unwrap();
        assert!(pem.contains("BEGIN PUBLIC KEY"));

        let json: serde_json::Value =
            serde_json::from_slice(&store.export_public_key(&key_id, PublicKeyFormat::Json).unwrap()).unwrap();
        assert_eq!(json["key_id"], key_id.as_str());
        assert_eq!(json["algorithm"], "ecdsa");
        assert_eq!(STANDARD.decode(json["public_key"].as_str().unwrap()).unwrap(), der);
    }

    #[test]
    fn test_import_public_key() {
        let producer = KeyStore::new();
        let key_id = ecdsa_key(&producer);
        let public = producer.get_public_key(&key_id).unwrap();

        let consumer = KeyStore::new();
        consumer.import_public_key(&key_id, public.clone(), "qr_signing").unwrap();
        assert_eq!(consumer.get_public_key(&key_id).unwrap(), public);
        assert!(matches!(
            consumer.get_private_key(&key_id),
            Err(KeyStoreError::PublicKeyOnly(_))
        ));
        assert!(consumer.find_signing_key("qr_signing").is_none());

        // Re-import is a no-op
        consumer.import_public_key(&key_id, public.clone(), "qr_signing").unwrap();
        assert_eq!(consumer.list_keys().len(), 1);

        assert!(matches!(
            consumer.import_public_key("0000", public, "qr_signing"),
            Err(KeyStoreError::InvalidKeySpec(_))
        ));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let wrapping = SecretKey32::random();
        let store = KeyStore::with_wrapping_key(wrapping.clone());
        let key_id = ecdsa_key(&store);
        store.get_private_key(&key_id).unwrap();

        let restored = KeyStore::from_snapshot(store.snapshot(), wrapping).unwrap();
        let record = restored.get_key_info(&key_id).unwrap();
        assert_eq!(record.usage_count, 1);
        assert!(restored.get_private_key(&key_id).is_ok());
    }

    #[test]
    fn test_snapshot_wrong_wrapping_key() {
        let store = KeyStore::new();
        let key_id = ecdsa_key(&store);
        match KeyStore::from_snapshot(store.snapshot(), SecretKey32::random()) {
            Err(KeyStoreError::KeyDecryption(id)) => assert_eq!(id, key_id),
            other => panic!("expected KeyDecryption, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_snapshot_file() {
        let wrapping = SecretKey32::random();
        let store = KeyStore::with_wrapping_key(wrapping.clone());
        let key_id = ecdsa_key(&store);

        let path = std::env::temp_dir().join(format!("qrlive-keys-{}.json", uuid::Uuid::new_v4()));
        store.save_snapshot(&path).unwrap();
        let restored = KeyStore::load_snapshot(&path, wrapping);
        std::fs::remove_file(&path).unwrap();

        assert!(restored.unwrap().contains(&key_id));
    }

    #[test]
    fn test_load_missing_snapshot() {
        assert!(matches!(
            KeyStore::load_snapshot("/nonexistent/keys.json", SecretKey32::random()),
            Err(KeyStoreError::Io(_))
        ));
    }
}
