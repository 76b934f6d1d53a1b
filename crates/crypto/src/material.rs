//! Asymmetric key material: supported key specs, generation, DER/PEM
//! encoding and parsing into signing/verifying keys.
//!
//! Public keys are SubjectPublicKeyInfo DER, private keys are PKCS#8 DER.

use qrlive_core::{KeyAlgorithm, MIN_ECDSA_BITS, MIN_RSA_BITS};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

use crate::keystore::KeyStoreError;

/// Largest RSA modulus accepted for generation and import.
pub const MAX_RSA_BITS: u32 = 4096;

/// A validated (algorithm, size) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    Rsa(u32),
    P256,
    P384,
    P521,
}

impl KeySpec {
    pub fn new(algorithm: KeyAlgorithm, key_size: u32) -> Result<Self, KeyStoreError> {
        match algorithm {
            KeyAlgorithm::Rsa if key_size < MIN_RSA_BITS => Err(KeyStoreError::InvalidKeySpec(
                format!("RSA key size {} below minimum {}", key_size, MIN_RSA_BITS),
            )),
            // Whole-byte moduli only
            KeyAlgorithm::Rsa if key_size <= MAX_RSA_BITS && key_size % 8 == 0 => Ok(Self::Rsa(key_size)),
            KeyAlgorithm::Rsa => Err(KeyStoreError::InvalidKeySpec(format!(
                "unsupported RSA key size {}: expected a multiple of 8 up to {}",
                key_size, MAX_RSA_BITS
            ))),
            KeyAlgorithm::Ecdsa if key_size < MIN_ECDSA_BITS => Err(KeyStoreError::InvalidKeySpec(
                format!("ECDSA key size {} below minimum {}", key_size, MIN_ECDSA_BITS),
            )),
            KeyAlgorithm::Ecdsa => match key_size {
                256 => Ok(Self::P256),
                384 => Ok(Self::P384),
                521 => Ok(Self::P521),
                other => Err(KeyStoreError::InvalidKeySpec(format!(
                    "unsupported ECDSA curve size {}",
                    other
                ))),
            },
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::Rsa(_) => KeyAlgorithm::Rsa,
            Self::P256 | Self::P384 | Self::P521 => KeyAlgorithm::Ecdsa,
        }
    }

    pub fn key_size(&self) -> u32 {
        match self {
            Self::Rsa(bits) => *bits,
            Self::P256 => 256,
            Self::P384 => 384,
            Self::P521 => 521,
        }
    }
}

/// Public half of a key pair, safe to hand out and persist in clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyMaterial {
    pub algorithm: KeyAlgorithm,
    pub key_size: u32,
    /// SubjectPublicKeyInfo DER
    #[serde(with = "der_base64")]
    pub der: Vec<u8>,
}

impl PublicKeyMaterial {
    /// Stable identifier derived from the public key bytes.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.der);
        // First 16 bytes as hex
        hex::encode(&hash.as_bytes()[..16])
    }

    pub fn spec(&self) -> Result<KeySpec, KeyStoreError> {
        KeySpec::new(self.algorithm, self.key_size)
    }

    /// Parse the DER and check it agrees with the declared algorithm and size.
    pub(crate) fn parse(&self) -> Result<VerifyingKeyKind, KeyStoreError> {
        let invalid = |e: &dyn fmt::Display| KeyStoreError::InvalidKeySpec(format!("public key: {}", e));
        match self.spec()? {
            KeySpec::Rsa(bits) => {
                let key = RsaPublicKey::from_public_key_der(&self.der).map_err(|e| invalid(&e))?;
                let actual = key.size() * 8;
                if actual != bits as usize {
                    return Err(KeyStoreError::InvalidKeySpec(format!(
                        "declared RSA size {} but key has {} bits",
                        bits, actual
                    )));
                }
                Ok(VerifyingKeyKind::Rsa(key))
            }
            KeySpec::P256 => {
                let key = p256::PublicKey::from_public_key_der(&self.der).map_err(|e| invalid(&e))?;
                Ok(VerifyingKeyKind::P256(p256::ecdsa::VerifyingKey::from(&key)))
            }
            KeySpec::P384 => {
                let key = p384::PublicKey::from_public_key_der(&self.der).map_err(|e| invalid(&e))?;
                Ok(VerifyingKeyKind::P384(p384::ecdsa::VerifyingKey::from(&key)))
            }
            KeySpec::P521 => {
                let key = p521::PublicKey::from_public_key_der(&self.der).map_err(|e| invalid(&e))?;
                let key = p521::ecdsa::VerifyingKey::from_affine(*key.as_affine()).map_err(|e| invalid(&e))?;
                Ok(VerifyingKeyKind::P521(key))
            }
        }
    }

    pub fn to_pem(&self) -> Result<String, KeyStoreError> {
        let pem = match self.spec()? {
            KeySpec::Rsa(_) => RsaPublicKey::from_public_key_der(&self.der)
                .and_then(|key| key.to_public_key_pem(LineEnding::LF)),
            KeySpec::P256 => p256::PublicKey::from_public_key_der(&self.der)
                .and_then(|key| key.to_public_key_pem(LineEnding::LF)),
            KeySpec::P384 => p384::PublicKey::from_public_key_der(&self.der)
                .and_then(|key| key.to_public_key_pem(LineEnding::LF)),
            KeySpec::P521 => p521::PublicKey::from_public_key_der(&self.der)
                .and_then(|key| key.to_public_key_pem(LineEnding::LF)),
        };
        pem.map_err(|e| KeyStoreError::Serialization(e.to_string()))
    }
}

/// Decrypted private key. Lives only for one sign call and is wiped on drop.
pub struct PrivateKeyMaterial {
    pub algorithm: KeyAlgorithm,
    pub key_size: u32,
    der: Zeroizing<Vec<u8>>,
}

impl PrivateKeyMaterial {
    pub(crate) fn new(algorithm: KeyAlgorithm, key_size: u32, der: Zeroizing<Vec<u8>>) -> Self {
        Self {
            algorithm,
            key_size,
            der,
        }
    }

    /// PKCS#8 DER
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub(crate) fn parse(&self) -> Result<SigningKeyKind, KeyStoreError> {
        let invalid = |e: &dyn fmt::Display| KeyStoreError::InvalidKeySpec(format!("private key: {}", e));
        match KeySpec::new(self.algorithm, self.key_size)? {
            KeySpec::Rsa(_) => RsaPrivateKey::from_pkcs8_der(&self.der)
                .map(SigningKeyKind::Rsa)
                .map_err(|e| invalid(&e)),
            KeySpec::P256 => p256::SecretKey::from_pkcs8_der(&self.der)
                .map(|secret| SigningKeyKind::P256(p256::ecdsa::SigningKey::from(&secret)))
                .map_err(|e| invalid(&e)),
            KeySpec::P384 => p384::SecretKey::from_pkcs8_der(&self.der)
                .map(|secret| SigningKeyKind::P384(p384::ecdsa::SigningKey::from(&secret)))
                .map_err(|e| invalid(&e)),
            KeySpec::P521 => {
                let secret = p521::SecretKey::from_pkcs8_der(&self.der).map_err(|e| invalid(&e))?;
                p521::ecdsa::SigningKey::from_slice(&secret.to_bytes())
                    .map(SigningKeyKind::P521)
                    .map_err(|e| invalid(&e))
            }
        }
    }
}

impl fmt::Debug for PrivateKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKeyMaterial")
            .field("algorithm", &self.algorithm)
            .field("key_size", &self.key_size)
            .finish_non_exhaustive()
    }
}

pub(crate) enum VerifyingKeyKind {
    Rsa(RsaPublicKey),
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
    P521(p521::ecdsa::VerifyingKey),
}

pub(crate) enum SigningKeyKind {
    Rsa(RsaPrivateKey),
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
    P521(p521::ecdsa::SigningKey),
}

/// Generate a fresh key pair for `spec`.
pub fn generate(spec: KeySpec) -> Result<(PublicKeyMaterial, PrivateKeyMaterial), KeyStoreError> {
    let failed = |e: &dyn fmt::Display| KeyStoreError::KeyGeneration(e.to_string());

    let (public_der, private_der) = match spec {
        KeySpec::Rsa(bits) => {
            let key = RsaPrivateKey::new(&mut OsRng, bits as usize).map_err(|e| failed(&e))?;
            let private = key.to_pkcs8_der().map_err(|e| failed(&e))?;
            let public = key.to_public_key().to_public_key_der().map_err(|e| failed(&e))?;
            (public.as_bytes().to_vec(), private.as_bytes().to_vec())
        }
        KeySpec::P256 => {
            let secret = p256::SecretKey::random(&mut OsRng);
            let private = secret.to_pkcs8_der().map_err(|e| failed(&e))?;
            let public = secret.public_key().to_public_key_der().map_err(|e| failed(&e))?;
            (public.as_bytes().to_vec(), private.as_bytes().to_vec())
        }
        KeySpec::P384 => {
            let secret = p384::SecretKey::random(&mut OsRng);
            let private = secret.to_pkcs8_der().map_err(|e| failed(&e))?;
            let public = secret.public_key().to_public_key_der().map_err(|e| failed(&e))?;
            (public.as_bytes().to_vec(), private.as_bytes().to_vec())
        }
        KeySpec::P521 => {
            let secret = p521::SecretKey::random(&mut OsRng);
            let private = secret.to_pkcs8_der().map_err(|e| failed(&e))?;
            let public = secret.public_key().to_public_key_der().map_err(|e| failed(&e))?;
            (public.as_bytes().to_vec(), private.as_bytes().to_vec())
        }
    };

    Ok((
        PublicKeyMaterial {
            algorithm: spec.algorithm(),
            key_size: spec.key_size(),
            der: public_der,
        },
        PrivateKeyMaterial::new(spec.algorithm(), spec.key_size(), Zeroizing::new(private_der)),
    ))
}

mod der_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
