//! Payload enhancement and verification.
//!
//! Enhance applies the layers in a fixed order: signature over the canonical
//! base payload, HMAC over the base merged with the signature layer, then
//! field encryption. Verify runs the reverse: decrypt, check the HMAC, check
//! the signature, then compare clear values against the caller's context.
//!
//! Optional layers degrade: a signing or encryption failure is logged and
//! reported in [`EnhanceOutcome::degraded`] while the payload is still
//! emitted. The HMAC layer never degrades.

use chrono::{SecondsFormat, Utc};
use qrlive_core::{
    canonicalize, fields, is_layer_field, BasePayload, EncryptionLayer, EnhancedPayload, HmacAlgorithm,
    IntegrityLayer, PipelineConfig, SignatureLayer, VerificationContext, VerificationResult,
};
use qrlive_crypto::{
    FieldEncryptor, IntegrityTagger, KeyStore, Signer, SigningError, SigningMetrics, VerificationMetrics,
    Verifier,
};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, PipelineResult};

/// Which optional layers [`PayloadPipeline::enhance`] applies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnhanceOptions {
    /// Add the signature layer
    pub sign: bool,
    /// Add the encryption layer
    pub encrypt: bool,
    /// Base members to encrypt when `encrypt` is set
    pub sensitive_fields: Vec<String>,
}

impl EnhanceOptions {
    /// HMAC only.
    pub fn integrity_only() -> Self {
        Self::default()
    }

    /// Signature and HMAC.
    pub fn signed() -> Self {
        Self {
            sign: true,
            ..Self::default()
        }
    }

    /// Enable encryption of `fields`.
    pub fn with_encryption<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.encrypt = true;
        self.sensitive_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Options as configured in `signing` and `encryption`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            sign: config.signing.enabled,
            encrypt: config.encryption.enabled,
            sensitive_fields: config.encryption.sensitive_fields.clone(),
        }
    }
}

/// An optional layer that was requested but left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradedLayer {
    /// Signing failed; payload carries no signature
    Signature(String),
    /// Encryption failed; sensitive fields travel in clear
    Encryption(String),
}

impl DegradedLayer {
    /// Layer name for logs and reports.
    pub fn layer(&self) -> &'static str {
        match self {
            Self::Signature(_) => "signature",
            Self::Encryption(_) => "encryption",
        }
    }

    /// Failure that caused the degradation.
    pub fn reason(&self) -> &str {
        match self {
            Self::Signature(reason) | Self::Encryption(reason) => reason,
        }
    }
}

/// Result of [`PayloadPipeline::enhance`].
#[derive(Debug, Clone)]
pub struct EnhanceOutcome {
    /// The enhanced payload, ready for the wire
    pub payload: EnhancedPayload,
    /// Optional layers that were requested but could not be applied
    pub degraded: Vec<DegradedLayer>,
}

impl EnhanceOutcome {
    /// True if any requested layer is missing.
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineMetrics {
    /// Payloads returned by `enhance`
    pub payloads_enhanced: u64,
    /// Enhancements emitted without a requested signature
    pub signature_degradations: u64,
    /// Enhancements emitted without requested encryption
    pub encryption_degradations: u64,
    /// Verify calls, malformed input included
    pub verifications: u64,
    /// Verify calls that did not establish a valid HMAC
    pub verification_failures: u64,
    /// Signer counters
    pub signing: SigningMetrics,
    /// Signature verification counters
    pub signature_checks: VerificationMetrics,
    /// Wrapped data keys currently retained
    pub data_keys: usize,
}

#[derive(Default)]
struct Counters {
    enhanced: AtomicU64,
    signature_degraded: AtomicU64,
    encryption_degraded: AtomicU64,
    verifications: AtomicU64,
    verification_failures: AtomicU64,
}

/// Assembles a [`PayloadPipeline`] from injected or default components.
pub struct PipelineBuilder {
    config: PipelineConfig,
    key_store: Option<Arc<KeyStore>>,
    tagger: Option<IntegrityTagger>,
    encryptor: Option<FieldEncryptor>,
}

impl PipelineBuilder {
    /// Share an existing key store.
    pub fn key_store(mut self, key_store: Arc<KeyStore>) -> Self {
        self.key_store = Some(key_store);
        self
    }

    /// Inject the HMAC master key holder.
    pub fn integrity_tagger(mut self, tagger: IntegrityTagger) -> Self {
        self.tagger = Some(tagger);
        self
    }

    /// Inject the field encryptor.
    pub fn field_encryptor(mut self, encryptor: FieldEncryptor) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    /// Validate the configuration and build the pipeline.
    pub fn build(self) -> PipelineResult<PayloadPipeline> {
        let config = self.config;
        config.validate().map_err(|e| PipelineError::Config(e.to_string()))?;

        let tagger = self
            .tagger
            .unwrap_or_else(|| IntegrityTagger::new(config.integrity.algorithm));
        if tagger.algorithm() != config.integrity.algorithm {
            return Err(PipelineError::Config(format!(
                "integrity tagger uses {} but configuration requires {}",
                tagger.algorithm(),
                config.integrity.algorithm
            )));
        }

        let key_store = self.key_store.unwrap_or_else(|| Arc::new(KeyStore::new()));
        let encryptor = self
            .encryptor
            .unwrap_or_else(|| FieldEncryptor::new(config.encryption.max_data_keys));

        info!(
            hmac_key_id = %tagger.key_id(),
            hmac_algorithm = %tagger.algorithm(),
            encryption_key_id = %encryptor.key_id(),
            signing = config.signing.enabled,
            encryption = config.encryption.enabled,
            "Payload pipeline ready"
        );

        Ok(PayloadPipeline {
            signer: Signer::new(Arc::clone(&key_store)),
            verifier: Verifier::new(Arc::clone(&key_store)),
            key_store,
            tagger,
            encryptor,
            signing_key_id: Mutex::new(None),
            counters: Counters::default(),
            config,
        })
    }
}

/// Orchestrates the signature, integrity and encryption layers.
///
/// Safe to share across threads; `enhance` and `verify` may run concurrently.
pub struct PayloadPipeline {
    config: PipelineConfig,
    key_store: Arc<KeyStore>,
    signer: Signer,
    verifier: Verifier,
    tagger: IntegrityTagger,
    encryptor: FieldEncryptor,
    signing_key_id: Mutex<Option<String>>,
    counters: Counters,
}

impl PayloadPipeline {
    /// Pipeline with a fresh key store, HMAC master key and encryptor.
    pub fn new(config: PipelineConfig) -> PipelineResult<Self> {
        Self::builder(config).build()
    }

    /// Start assembling a pipeline.
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            key_store: None,
            tagger: None,
            encryptor: None,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Key store backing the signer and verifier.
    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.key_store
    }

    /// Identifier of the HMAC master key.
    pub fn hmac_key_id(&self) -> &str {
        self.tagger.key_id()
    }

    /// Identifier of the data-key wrapping key.
    pub fn encryption_key_id(&self) -> &str {
        self.encryptor.key_id()
    }

    /// Verification context with the configured drift window and no
    /// expectations yet.
    pub fn verification_context(&self) -> VerificationContext {
        VerificationContext::new(self.config.verification.max_time_drift_secs)
    }

    /// Id of the default signing key, generating it on first use.
    ///
    /// An existing key registered for the configured purpose is reused.
    pub fn ensure_signing_key(&self) -> Result<String, SigningError> {
        let mut cached = self.signing_key_id.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(key_id) = cached.as_ref() {
            if self.key_store.contains(key_id) {
                return Ok(key_id.clone());
            }
        }

        let signing = &self.config.signing;
        let key_id = match self.key_store.find_signing_key(&signing.purpose) {
            Some(record) => record.key_id,
            None => self
                .key_store
                .generate_keypair(signing.algorithm, signing.key_size, &signing.purpose)?,
        };
        *cached = Some(key_id.clone());
        Ok(key_id)
    }

    /// Sign with `key_id` from now on instead of the default key.
    pub fn use_signing_key(&self, key_id: &str) -> PipelineResult<()> {
        if !self.key_store.contains(key_id) {
            return Err(PipelineError::Config(format!("unknown signing key {}", key_id)));
        }
        *self.signing_key_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(key_id.to_string());
        Ok(())
    }

    /// Apply the requested layers to `base`.
    ///
    /// Fails only if `base` is invalid or the HMAC cannot be computed.
    pub fn enhance(&self, base: &BasePayload, options: &EnhanceOptions) -> PipelineResult<EnhanceOutcome> {
        base.validate()?;
        let sequence = base.sequence_number;
        let mut degraded = Vec::new();

        let signature = if options.sign {
            let canonical = base.canonical_bytes()?;
            match self.signature_layer(&canonical) {
                Ok(layer) => Some(layer),
                Err(e) => {
                    warn!(sequence, error = %e, "Signature layer skipped");
                    self.counters.signature_degraded.fetch_add(1, Ordering::Relaxed);
                    degraded.push(DegradedLayer::Signature(e.to_string()));
                    None
                }
            }
        } else {
            None
        };

        let scope = EnhancedPayload::integrity_scope(base, signature.as_ref())?;
        let tag = self.tagger.tag(&canonicalize(&scope)).map_err(|e| {
            error!(sequence, error = %e, "Integrity tagging failed");
            e
        })?;
        let integrity = IntegrityLayer {
            hmac: tag.to_hex(),
            key_id: tag.key_id,
            algorithm: tag.algorithm.as_str().to_string(),
            checked_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        let (base, encryption) = if options.encrypt {
            match self.encryption_layer(base, &options.sensitive_fields) {
                Ok((cleared, layer)) => (cleared, Some(layer)),
                Err(e) => {
                    warn!(sequence, error = %e, "Encryption layer skipped");
                    self.counters.encryption_degraded.fetch_add(1, Ordering::Relaxed);
                    degraded.push(DegradedLayer::Encryption(e.to_string()));
                    (base.clone(), None)
                }
            }
        } else {
            (base.clone(), None)
        };

        self.counters.enhanced.fetch_add(1, Ordering::Relaxed);
        debug!(
            sequence,
            signed = signature.is_some(),
            encrypted = encryption.is_some(),
            "Enhanced payload"
        );

        Ok(EnhanceOutcome {
            payload: EnhancedPayload {
                base,
                signature,
                integrity,
                encryption,
            },
            degraded,
        })
    }

    /// [`enhance`](Self::enhance) with the layers selected by configuration.
    pub fn enhance_with_defaults(&self, base: &BasePayload) -> PipelineResult<EnhanceOutcome> {
        self.enhance(base, &EnhanceOptions::from_config(&self.config))
    }

    fn signature_layer(&self, canonical: &[u8]) -> Result<SignatureLayer, SigningError> {
        let key_id = self.ensure_signing_key()?;
        let result = self.signer.sign(&key_id, canonical)?;
        Ok(SignatureLayer {
            digital_signature: hex::encode(&result.signature),
            signing_key_id: result.key_id,
            signature_algorithm: result.algorithm.id().to_string(),
        })
    }

    fn encryption_layer(
        &self,
        base: &BasePayload,
        names: &[String],
    ) -> PipelineResult<(BasePayload, EncryptionLayer)> {
        let requested: Vec<String> = names.iter().filter(|name| !is_layer_field(name)).cloned().collect();
        let sealed = self.encryptor.encrypt_fields(&base.to_fields()?, &requested)?;

        let ciphertexts: BTreeMap<String, String> = sealed
            .encrypted_fields
            .iter()
            .filter_map(|name| {
                sealed
                    .fields
                    .get(name)
                    .and_then(Value::as_str)
                    .map(|ciphertext| (name.clone(), ciphertext.to_string()))
            })
            .collect();
        let cleared = base.without_fields(&sealed.encrypted_fields)?;

        Ok((
            cleared,
            EncryptionLayer {
                encrypted_fields: sealed.encrypted_fields,
                encryption_key_id: sealed.encryption_key_id,
                data_key_id: sealed.data_key_id,
                sealed: ciphertexts,
            },
        ))
    }

    /// Verify wire JSON. Never fails; every problem is reported in the result.
    pub fn verify(&self, raw: &str, context: &VerificationContext) -> VerificationResult {
        match EnhancedPayload::from_wire_json(raw) {
            Ok(payload) => self.verify_payload(&payload, context),
            Err(e) => self.record_malformed(e.to_string()),
        }
    }

    /// Verify raw bytes as decoded from a QR image.
    pub fn verify_wire(&self, raw: &[u8], context: &VerificationContext) -> VerificationResult {
        match std::str::from_utf8(raw) {
            Ok(text) => self.verify(text, context),
            Err(e) => self.record_malformed(format!("payload is not UTF-8: {}", e)),
        }
    }

    /// Verify an already decoded payload.
    pub fn verify_payload(&self, payload: &EnhancedPayload, context: &VerificationContext) -> VerificationResult {
        let result = self.verify_layers(payload, context);
        self.counters.verifications.fetch_add(1, Ordering::Relaxed);
        if !result.hmac_verified {
            self.counters.verification_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                sequence = payload.base.sequence_number,
                error = result.error.as_deref().unwrap_or_default(),
                "Payload failed verification"
            );
        }
        result
    }

    fn record_malformed(&self, error: String) -> VerificationResult {
        self.counters.verifications.fetch_add(1, Ordering::Relaxed);
        self.counters.verification_failures.fetch_add(1, Ordering::Relaxed);
        warn!(error = %error, "Malformed payload");
        VerificationResult::malformed(error)
    }

    fn verify_layers(&self, payload: &EnhancedPayload, context: &VerificationContext) -> VerificationResult {
        let base = match sealed_layer(payload) {
            None => Cow::Borrowed(&payload.base),
            Some(layer) => match self.decrypt_base(payload, layer) {
                Ok(base) => Cow::Owned(base),
                Err(e) => return clear_field_result(&payload.base, layer, context, &e),
            },
        };

        if let Err(e) = base.validate() {
            return VerificationResult::malformed(e.to_string());
        }

        let hmac_verified = self.check_integrity(&base, payload.signature.as_ref(), &payload.integrity);
        let signature_verified = payload
            .signature
            .as_ref()
            .is_some_and(|layer| self.check_signature(&base, layer));

        VerificationResult {
            valid_json: true,
            identity_verified: context.identity_matches(&base.identity_hash),
            time_verified: context.time_within_drift(&base.timestamp),
            blockchain_verified: context.blockchain_matches(&base.blockchain_hashes),
            signature_verified,
            hmac_verified,
            encrypted: payload.encryption.is_some(),
            error: (!hmac_verified).then(|| "HMAC verification failed".to_string()),
        }
    }

    /// Recover the plain base payload, decrypting sealed fields if present.
    ///
    /// Does not check the HMAC or signature; pair with
    /// [`verify_payload`](Self::verify_payload) before trusting the values.
    pub fn open(&self, payload: &EnhancedPayload) -> PipelineResult<BasePayload> {
        match sealed_layer(payload) {
            Some(layer) => self.decrypt_base(payload, layer),
            None => Ok(payload.base.clone()),
        }
    }

    fn decrypt_base(&self, payload: &EnhancedPayload, layer: &EncryptionLayer) -> PipelineResult<BasePayload> {
        let wire = payload.wire_base_fields()?;
        let plain = self
            .encryptor
            .decrypt_fields(&wire, &layer.encrypted_fields, &layer.data_key_id)?;
        Ok(BasePayload::from_fields(plain)?)
    }

    fn check_integrity(
        &self,
        base: &BasePayload,
        signature: Option<&SignatureLayer>,
        layer: &IntegrityLayer,
    ) -> bool {
        let algorithm_matches = layer
            .algorithm
            .parse::<HmacAlgorithm>()
            .map(|algorithm| algorithm == self.tagger.algorithm())
            .unwrap_or(false);
        // Undecodable tags are still run through the comparison
        let tag = hex::decode(&layer.hmac).unwrap_or_default();

        let tag_matches = match EnhancedPayload::integrity_scope(base, signature) {
            Ok(scope) => self.tagger.check(&canonicalize(&scope), &tag, &layer.key_id),
            Err(_) => false,
        };
        tag_matches && algorithm_matches
    }

    fn check_signature(&self, base: &BasePayload, layer: &SignatureLayer) -> bool {
        let signature = hex::decode(&layer.digital_signature).unwrap_or_default();
        match base.canonical_bytes() {
            Ok(canonical) => self.verifier.verify(
                &layer.signing_key_id,
                &layer.signature_algorithm,
                &canonical,
                &signature,
            ),
            Err(_) => false,
        }
    }

    /// Current counters.
    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            payloads_enhanced: self.counters.enhanced.load(Ordering::Relaxed),
            signature_degradations: self.counters.signature_degraded.load(Ordering::Relaxed),
            encryption_degradations: self.counters.encryption_degraded.load(Ordering::Relaxed),
            verifications: self.counters.verifications.load(Ordering::Relaxed),
            verification_failures: self.counters.verification_failures.load(Ordering::Relaxed),
            signing: self.signer.metrics(),
            signature_checks: self.verifier.metrics(),
            data_keys: self.encryptor.data_key_count(),
        }
    }
}

/// The encryption layer, if it sealed at least one field.
///
/// An empty `_encrypted_fields` leaves the base entirely in clear and needs
/// no data key, so any instance can verify it.
fn sealed_layer(payload: &EnhancedPayload) -> Option<&EncryptionLayer> {
    payload
        .encryption
        .as_ref()
        .filter(|layer| !layer.encrypted_fields.is_empty())
}

/// Result for a payload whose encrypted fields could not be recovered.
///
/// Crypto checks are all false; context comparisons still run on members
/// that travelled in clear.
fn clear_field_result(
    base: &BasePayload,
    layer: &EncryptionLayer,
    context: &VerificationContext,
    error: &PipelineError,
) -> VerificationResult {
    let in_clear = |field: &str| !layer.encrypted_fields.iter().any(|name| name == field);
    VerificationResult {
        valid_json: true,
        identity_verified: in_clear(fields::IDENTITY_HASH) && context.identity_matches(&base.identity_hash),
        time_verified: in_clear(fields::TIMESTAMP) && context.time_within_drift(&base.timestamp),
        blockchain_verified: in_clear(fields::BLOCKCHAIN_HASHES)
            && context.blockchain_matches(&base.blockchain_hashes),
        signature_verified: false,
        hmac_verified: false,
        encrypted: true,
        error: Some(error.to_string()),
    }
}
