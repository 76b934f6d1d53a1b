//! Key domains across independent pipeline instances.
//!
//! A pipeline's signing keys, HMAC master key and data keys are meaningful
//! only inside its own domain. These tests pin down what a second instance
//! can and cannot verify.

use crate::test_utils::{current_timestamp, ecdsa_config, live_payload, TestSite, IDENTITY_HASH};
use qrlive_core::{BasePayload, EnhancedPayload};
use qrlive_crypto::KeyStore;
use qrlive_pipeline::{EnhanceOptions, PayloadPipeline};
use std::sync::Arc;

fn signed_and_encrypted() -> EnhanceOptions {
    EnhanceOptions::signed().with_encryption(["user_data"])
}

#[test]
fn test_unrelated_instances_reject_everything() {
    let producer = PayloadPipeline::new(ecdsa_config()).unwrap();
    let stranger = PayloadPipeline::new(ecdsa_config()).unwrap();

    let wire = producer
        .enhance(&live_payload(1), &EnhanceOptions::signed())
        .unwrap()
        .payload
        .to_wire_json()
        .unwrap();

    let result = stranger.verify(&wire, &stranger.verification_context().with_identity(IDENTITY_HASH));
    assert!(result.valid_json);
    assert!(!result.hmac_verified);
    assert!(!result.signature_verified);
    assert!(result.identity_verified);
    assert!(!result.is_trusted(false));
}

#[test]
fn test_same_site_shares_hmac_but_not_signatures() {
    let site = TestSite::new();
    let producer = site.pipeline();
    let verifier = site.pipeline();
    assert_eq!(producer.hmac_key_id(), verifier.hmac_key_id());

    let wire = producer
        .enhance(&live_payload(1), &EnhanceOptions::signed())
        .unwrap()
        .payload
        .to_wire_json()
        .unwrap();

    let result = verifier.verify(&wire, &verifier.verification_context().with_identity(IDENTITY_HASH));
    assert!(result.hmac_verified);
    assert!(!result.signature_verified);
    assert!(result.is_trusted(false));
    assert!(!result.is_trusted(true));
    assert_eq!(verifier.metrics().signature_checks.rejections_total, 1);
}

#[test]
fn test_shared_key_store_verifies_signatures_but_not_ciphertext() {
    let site = TestSite::new();
    let key_store = Arc::new(KeyStore::new());
    let producer = site.pipeline_with_store(Arc::clone(&key_store));
    let verifier = site.pipeline_with_store(key_store);

    let wire = producer
        .enhance(&live_payload(1), &EnhanceOptions::signed())
        .unwrap()
        .payload
        .to_wire_json()
        .unwrap();
    let result = verifier.verify(&wire, &verifier.verification_context());
    assert!(result.hmac_verified);
    assert!(result.signature_verified);

    // Data keys never leave the encrypting instance
    let sealed = producer
        .enhance(&live_payload(2), &signed_and_encrypted())
        .unwrap()
        .payload
        .to_wire_json()
        .unwrap();
    let result = verifier.verify(&sealed, &verifier.verification_context().with_identity(IDENTITY_HASH));
    assert!(result.encrypted);
    assert!(!result.hmac_verified);
    assert!(!result.signature_verified);
    assert!(result.identity_verified);
    assert!(result.error.is_some());

    let own = producer.verify(&sealed, &producer.verification_context().with_identity(IDENTITY_HASH));
    assert!(own.is_trusted(true));
    assert!(own.encrypted);
}

#[test]
fn test_nothing_sealed_verifies_on_another_instance() {
    let site = TestSite::new();
    let producer = site.pipeline();
    let verifier = site.pipeline();

    // A tick without user_data: the requested field is absent, so nothing is sealed
    let base = BasePayload::new(current_timestamp(), IDENTITY_HASH, 7)
        .with_blockchain_hash("bitcoin", "000000000000000000024bead8df69990852c202db0e0097c1a12ea637d7e96a");
    let outcome = producer.enhance(&base, &signed_and_encrypted()).unwrap();
    assert!(!outcome.is_degraded());
    let layer = outcome.payload.encryption.as_ref().unwrap();
    assert!(layer.encrypted_fields.is_empty());
    assert_eq!(producer.metrics().data_keys, 0);

    let wire = outcome.payload.to_wire_json().unwrap();
    let result = verifier.verify(&wire, &verifier.verification_context().with_identity(IDENTITY_HASH));
    assert!(result.encrypted);
    assert!(result.hmac_verified);
    assert!(result.identity_verified);
    assert!(result.time_verified);
    assert!(result.error.is_none());
    assert!(result.is_trusted(false));
    // Signing keys are still per instance
    assert!(!result.signature_verified);

    let opened = verifier.open(&EnhancedPayload::from_wire_json(&wire).unwrap()).unwrap();
    assert_eq!(opened, base);
}

#[test]
fn test_deleted_signing_key_is_replaced() {
    let pipeline = TestSite::new().pipeline();
    let first = pipeline.ensure_signing_key().unwrap();
    let old_wire = pipeline
        .enhance(&live_payload(1), &EnhanceOptions::signed())
        .unwrap()
        .payload
        .to_wire_json()
        .unwrap();

    assert!(pipeline.key_store().delete_key(&first));
    let second = pipeline.ensure_signing_key().unwrap();
    assert_ne!(first, second);

    let result = pipeline.verify(&old_wire, &pipeline.verification_context());
    assert!(result.hmac_verified);
    assert!(!result.signature_verified);

    let new_wire = pipeline
        .enhance(&live_payload(2), &EnhanceOptions::signed())
        .unwrap()
        .payload
        .to_wire_json()
        .unwrap();
    let payload = EnhancedPayload::from_wire_json(&new_wire).unwrap();
    assert_eq!(payload.signature.unwrap().signing_key_id, second);
}
