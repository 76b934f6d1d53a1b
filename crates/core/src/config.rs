//! Configuration management for the QR Live Protocol pipeline.

use serde::{Deserialize, Serialize};
#[cfg(feature = "toml")]
use std::path::Path;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::types::{HmacAlgorithm, KeyAlgorithm};

/// Smallest accepted RSA modulus in bits.
pub const MIN_RSA_BITS: u32 = 2048;

/// Smallest accepted ECDSA curve size in bits.
pub const MIN_ECDSA_BITS: u32 = 256;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub signing: SigningConfig,
    pub integrity: IntegrityConfig,
    pub encryption: EncryptionConfig,
    pub verification: VerificationConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub enabled: bool,
    pub algorithm: KeyAlgorithm,
    pub key_size: u32,
    pub purpose: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    pub algorithm: HmacAlgorithm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub sensitive_fields: Vec<String>,
    /// Wrapped data keys retained for decryption before the oldest is evicted
    pub max_data_keys: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub max_time_drift_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub update_interval_ms: u64,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: KeyAlgorithm::Rsa,
            key_size: MIN_RSA_BITS,
            purpose: "qr_signing".to_string(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sensitive_fields: vec!["user_data".to_string()],
            max_data_keys: 4096,
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_time_drift_secs: 300,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 1000,
        }
    }
}

impl PipelineConfig {
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading pipeline configuration");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        let floor = match self.signing.algorithm {
            KeyAlgorithm::Rsa => MIN_RSA_BITS,
            KeyAlgorithm::Ecdsa => MIN_ECDSA_BITS,
        };
        if self.signing.key_size < floor {
            return Err(CoreError::Config(format!(
                "{} key size {} below minimum {}",
                self.signing.algorithm, self.signing.key_size, floor
            )));
        }
        if self.encryption.max_data_keys == 0 {
            return Err(CoreError::Config("encryption.max_data_keys must be positive".into()));
        }
        if self.generation.update_interval_ms == 0 {
            return Err(CoreError::Config("generation.update_interval_ms must be positive".into()));
        }
        debug!(
            signing = %self.signing.algorithm,
            key_size = self.signing.key_size,
            hmac = %self.integrity.algorithm,
            "Pipeline configuration validated"
        );
        Ok(())
    }
}
