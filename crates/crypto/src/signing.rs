//! Payload signing and verification.
//!
//! RSA keys sign with RSA-PSS/SHA-256. Every ECDSA curve (P-256, P-384 and
//! P-521) signs the SHA-256 digest of the message, so a verifier only ever
//! needs one hash. ECDSA signatures are DER encoded.
//!
//! # Security Model
//!
//! - The algorithm id is derived from the stored key, never from the caller
//! - Private keys are decrypted per call and dropped (zeroized) afterwards
//! - Verification returns `false` for every failure and always runs a full
//!   verify primitive, substituting a decoy key or signature when the real
//!   one cannot be parsed or found

use qrlive_core::KeyAlgorithm;
use rand::rngs::OsRng;
use rsa::pss;
use rsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Signer as _, Verifier as _};
use rsa::{BigUint, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::keystore::{KeyStore, KeyStoreError};
use crate::material::{KeySpec, PublicKeyMaterial, SigningKeyKind, VerifyingKeyKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    RsaPssSha256,
    EcdsaP256Sha256,
    EcdsaP384Sha256,
    EcdsaP521Sha256,
}

impl SignatureAlgorithm {
    pub fn for_spec(spec: KeySpec) -> Self {
        match spec {
            KeySpec::Rsa(_) => Self::RsaPssSha256,
            KeySpec::P256 => Self::EcdsaP256Sha256,
            KeySpec::P384 => Self::EcdsaP384Sha256,
            KeySpec::P521 => Self::EcdsaP521Sha256,
        }
    }

    /// Wire identifier carried in `signature_algorithm`.
    pub fn id(&self) -> &'static str {
        match self {
            Self::RsaPssSha256 => "rsa-pss-sha256",
            Self::EcdsaP256Sha256 => "ecdsa-p256-sha256",
            Self::EcdsaP384Sha256 => "ecdsa-p384-sha256",
            Self::EcdsaP521Sha256 => "ecdsa-p521-sha256",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "rsa-pss-sha256" => Some(Self::RsaPssSha256),
            "ecdsa-p256-sha256" => Some(Self::EcdsaP256Sha256),
            "ecdsa-p384-sha256" => Some(Self::EcdsaP384Sha256),
            "ecdsa-p521-sha256" => Some(Self::EcdsaP521Sha256),
            _ => None,
        }
    }

    pub fn key_algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::RsaPssSha256 => KeyAlgorithm::Rsa,
            Self::EcdsaP256Sha256 | Self::EcdsaP384Sha256 | Self::EcdsaP521Sha256 => KeyAlgorithm::Ecdsa,
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Signature plus the key and algorithm that produced it.
#[derive(Debug, Clone)]
pub struct SignatureResult {
    pub signature: Vec<u8>,
    pub key_id: String,
    pub algorithm: SignatureAlgorithm,
}

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    #[error("Unsupported key {key_id}: {reason}")]
    UnsupportedKey { key_id: String, reason: String },

    #[error("Cryptographic error: {reason}")]
    Crypto { reason: String },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SigningMetrics {
    pub signatures_total: u64,
    pub signing_errors_total: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VerificationMetrics {
    pub verifications_total: u64,
    pub rejections_total: u64,
}

/// Signs with keys held in a shared [`KeyStore`].
pub struct Signer {
    key_store: Arc<KeyStore>,
    signatures: AtomicU64,
    errors: AtomicU64,
}

impl Signer {
    pub fn new(key_store: Arc<KeyStore>) -> Self {
        Self {
            key_store,
            signatures: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.key_store
    }

    /// Sign `message` (already canonical bytes) with `key_id`.
    pub fn sign(&self, key_id: &str, message: &[u8]) -> Result<SignatureResult, SigningError> {
        match self.sign_inner(key_id, message) {
            Ok(result) => {
                self.signatures.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key_id, error = %e, "Signing failed");
                Err(e)
            }
        }
    }

    fn sign_inner(&self, key_id: &str, message: &[u8]) -> Result<SignatureResult, SigningError> {
        let record = self.key_store.get_key_info(key_id)?;
        let spec = KeySpec::new(record.algorithm, record.key_size).map_err(|e| SigningError::UnsupportedKey {
            key_id: key_id.to_string(),
            reason: e.to_string(),
        })?;
        let algorithm = SignatureAlgorithm::for_spec(spec);

        let private = self.key_store.get_private_key(key_id)?;
        let key = private.parse().map_err(|e| SigningError::UnsupportedKey {
            key_id: key_id.to_string(),
            reason: e.to_string(),
        })?;
        let crypto = |e: rsa::signature::Error| SigningError::Crypto { reason: e.to_string() };

        let signature = match key {
            SigningKeyKind::Rsa(key) => pss::BlindedSigningKey::<Sha256>::new(key)
                .try_sign_with_rng(&mut OsRng, message)
                .map_err(crypto)?
                .to_vec(),
            SigningKeyKind::P256(key) => {
                let signature: p256::ecdsa::Signature = key.try_sign(message).map_err(crypto)?;
                signature.to_der().as_bytes().to_vec()
            }
            SigningKeyKind::P384(key) => {
                let signature: p384::ecdsa::Signature = key.sign_prehash(&Sha256::digest(message)).map_err(crypto)?;
                signature.to_der().as_bytes().to_vec()
            }
            SigningKeyKind::P521(key) => {
                let signature: p521::ecdsa::Signature = key.sign_prehash(&p521_prehash(message)).map_err(crypto)?;
                signature.to_der().as_bytes().to_vec()
            }
        };

        debug!(key_id, algorithm = %algorithm, "Signed message");
        Ok(SignatureResult {
            signature,
            key_id: key_id.to_string(),
            algorithm,
        })
    }

    pub fn metrics(&self) -> SigningMetrics {
        SigningMetrics {
            signatures_total: self.signatures.load(Ordering::Relaxed),
            signing_errors_total: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Verifies signatures against public keys held in a [`KeyStore`].
pub struct Verifier {
    key_store: Arc<KeyStore>,
    verifications: AtomicU64,
    rejections: AtomicU64,
}

impl Verifier {
    pub fn new(key_store: Arc<KeyStore>) -> Self {
        Self {
            key_store,
            verifications: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Look up `key_id` and verify. Unknown keys verify as `false`.
    pub fn verify(&self, key_id: &str, algorithm_id: &str, message: &[u8], signature: &[u8]) -> bool {
        let verified = match self.key_store.get_public_key(key_id) {
            Ok(public) => verify_signature(&public, algorithm_id, message, signature),
            Err(_) => {
                run_decoy(SignatureAlgorithm::from_id(algorithm_id), message, signature);
                false
            }
        };

        self.verifications.fetch_add(1, Ordering::Relaxed);
        if !verified {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(key_id, algorithm_id, "Signature rejected");
        }
        verified
    }

    pub fn metrics(&self) -> VerificationMetrics {
        VerificationMetrics {
            verifications_total: self.verifications.load(Ordering::Relaxed),
            rejections_total: self.rejections.load(Ordering::Relaxed),
        }
    }
}

/// Verify `signature` over `message` with `public`.
///
/// `algorithm_id` must equal the id derived from the key itself; a mismatch
/// is a failure even if the signature is otherwise valid.
pub fn verify_signature(public: &PublicKeyMaterial, algorithm_id: &str, message: &[u8], signature: &[u8]) -> bool {
    let declared = SignatureAlgorithm::from_id(algorithm_id);
    match public.parse() {
        Ok(key) => {
            let (expected, verified) = match &key {
                VerifyingKeyKind::Rsa(key) => (SignatureAlgorithm::RsaPssSha256, verify_rsa(key, message, signature)),
                VerifyingKeyKind::P256(key) => {
                    (SignatureAlgorithm::EcdsaP256Sha256, verify_p256(key, message, signature))
                }
                VerifyingKeyKind::P384(key) => {
                    (SignatureAlgorithm::EcdsaP384Sha256, verify_p384(key, message, signature))
                }
                VerifyingKeyKind::P521(key) => {
                    (SignatureAlgorithm::EcdsaP521Sha256, verify_p521(key, message, signature))
                }
            };
            verified && declared == Some(expected)
        }
        Err(_) => {
            run_decoy(declared, message, signature);
            false
        }
    }
}

fn verify_rsa(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let key = pss::VerifyingKey::<Sha256>::new(key.clone());
    match pss::Signature::try_from(signature) {
        Ok(signature) => key.verify(message, &signature).is_ok(),
        Err(_) => false,
    }
}

fn verify_p256(key: &p256::ecdsa::VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    match p256::ecdsa::Signature::from_der(signature) {
        Ok(signature) => key.verify(message, &signature).is_ok(),
        Err(_) => {
            if let Some((_, decoy)) = &decoys().p256 {
                let _ = key.verify(message, decoy);
            }
            false
        }
    }
}

fn verify_p384(key: &p384::ecdsa::VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let prehash = Sha256::digest(message);
    match p384::ecdsa::Signature::from_der(signature) {
        Ok(signature) => key.verify_prehash(&prehash, &signature).is_ok(),
        Err(_) => {
            if let Some((_, decoy)) = &decoys().p384 {
                let _ = key.verify_prehash(&prehash, decoy);
            }
            false
        }
    }
}

fn verify_p521(key: &p521::ecdsa::VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let prehash = p521_prehash(message);
    match p521::ecdsa::Signature::from_der(signature) {
        Ok(signature) => key.verify_prehash(&prehash, &signature).is_ok(),
        Err(_) => {
            if let Some((_, decoy)) = &decoys().p521 {
                let _ = key.verify_prehash(&prehash, decoy);
            }
            false
        }
    }
}

/// SHA-256 digest left-padded to the 66-byte P-521 field.
///
/// The curve rejects prehashes shorter than half its field size. Leading
/// zeros leave the digest's integer value unchanged, so signatures stay
/// plain ECDSA/SHA-256.
fn p521_prehash(message: &[u8]) -> [u8; 66] {
    let digest = Sha256::digest(message);
    let mut padded = [0u8; 66];
    padded[66 - digest.len()..].copy_from_slice(&digest);
    padded
}

/// Fixed keys used to keep failure paths on the same cost as a real verify.
struct Decoys {
    rsa: Option<RsaPublicKey>,
    p256: Option<(p256::ecdsa::VerifyingKey, p256::ecdsa::Signature)>,
    p384: Option<(p384::ecdsa::VerifyingKey, p384::ecdsa::Signature)>,
    p521: Option<(p521::ecdsa::VerifyingKey, p521::ecdsa::Signature)>,
}

fn decoys() -> &'static Decoys {
    static DECOYS: OnceLock<Decoys> = OnceLock::new();
    DECOYS.get_or_init(|| Decoys {
        rsa: RsaPublicKey::new(BigUint::from_bytes_be(&[0xff; 256]), BigUint::from(65_537u32)).ok(),
        p256: p256::ecdsa::SigningKey::from_slice(&[7u8; 32]).ok().and_then(|key| {
            let signature: p256::ecdsa::Signature = key.try_sign(b"qrlive").ok()?;
            Some((p256::ecdsa::VerifyingKey::from(&key), signature))
        }),
        p384: p384::ecdsa::SigningKey::from_slice(&[7u8; 48]).ok().and_then(|key| {
            let signature: p384::ecdsa::Signature = key.sign_prehash(&Sha256::digest(b"qrlive")).ok()?;
            Some((p384::ecdsa::VerifyingKey::from(&key), signature))
        }),
        p521: p521::ecdsa::SigningKey::from_slice(&[7u8; 66]).ok().and_then(|key| {
            let signature: p521::ecdsa::Signature = key.sign_prehash(&p521_prehash(b"qrlive")).ok()?;
            Some((p521::ecdsa::VerifyingKey::from(&key), signature))
        }),
    })
}

fn run_decoy(algorithm: Option<SignatureAlgorithm>, message: &[u8], signature: &[u8]) {
    let decoys = decoys();
    match algorithm {
        Some(SignatureAlgorithm::RsaPssSha256) => {
            if let Some(key) = &decoys.rsa {
                verify_rsa(key, message, signature);
            }
        }
        Some(SignatureAlgorithm::EcdsaP384Sha256) => {
            if let Some((key, _)) = &decoys.p384 {
                verify_p384(key, message, signature);
            }
        }
        Some(SignatureAlgorithm::EcdsaP521Sha256) => {
            if let Some((key, _)) = &decoys.p521 {
                verify_p521(key, message, signature);
            }
        }
        Some(SignatureAlgorithm::EcdsaP256Sha256) | None => {
            if let Some((key, _)) = &decoys.p256 {
                verify_p256(key, message, signature);
            }
        }
    }
}
