//! Test utilities shared by the integration suites

use chrono::{SecondsFormat, Utc};
use qrlive_core::{BasePayload, HmacAlgorithm, KeyAlgorithm, PipelineConfig};
use qrlive_crypto::{IntegrityTagger, KeyStore, SecretKey32};
use qrlive_pipeline::{PayloadPipeline, PayloadSource};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Identity hash used by every fixture
pub const IDENTITY_HASH: &str = "5f1d7a3c9e0b2468";

/// Current time in the wire timestamp format
pub fn current_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Pipeline configuration signing with P-256
pub fn ecdsa_config() -> PipelineConfig {
    let mut config = PipelineConfig::default_config();
    config.signing.algorithm = KeyAlgorithm::Ecdsa;
    config.signing.key_size = 256;
    config.generation.update_interval_ms = 20;
    config
}

/// A base payload as a live source would produce it
pub fn live_payload(sequence: u64) -> BasePayload {
    let user_data = match json!({"display": "lobby", "frame": sequence}) {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    BasePayload::new(current_timestamp(), IDENTITY_HASH, sequence)
        .with_blockchain_hash("bitcoin", "000000000000000000024bead8df69990852c202db0e0097c1a12ea637d7e96a")
        .with_user_data(user_data)
}

/// Source producing [`live_payload`] for every tick
pub fn live_source() -> Arc<dyn PayloadSource> {
    Arc::new(|sequence: u64| -> anyhow::Result<BasePayload> { Ok(live_payload(sequence)) })
}

/// Test fixture for a site where several pipelines share one HMAC master key
pub struct TestSite {
    pub master_key: SecretKey32,
    pub hmac_key_id: String,
}

impl TestSite {
    /// Create a site with a fresh master key
    pub fn new() -> Self {
        Self {
            master_key: SecretKey32::random(),
            hmac_key_id: format!("site-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Pipeline of this site with its own key store
    pub fn pipeline(&self) -> PayloadPipeline {
        self.pipeline_with_store(Arc::new(KeyStore::new()))
    }

    /// Pipeline of this site backed by `key_store`
    pub fn pipeline_with_store(&self, key_store: Arc<KeyStore>) -> PayloadPipeline {
        PayloadPipeline::builder(ecdsa_config())
            .key_store(key_store)
            .integrity_tagger(IntegrityTagger::with_master_key_id(
                self.master_key.clone(),
                self.hmac_key_id.clone(),
                HmacAlgorithm::Sha256,
            ))
            .build()
            .expect("Failed to build site pipeline")
    }
}

impl Default for TestSite {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique snapshot path under the system temp directory
pub fn temp_snapshot_path() -> PathBuf {
    std::env::temp_dir().join(format!("qrlive-keys-{}.json", uuid::Uuid::new_v4()))
}
