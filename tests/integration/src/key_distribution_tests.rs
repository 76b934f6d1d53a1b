//! Key store persistence and out-of-band public key distribution.

use crate::test_utils::{live_payload, temp_snapshot_path, TestSite, IDENTITY_HASH};
use qrlive_crypto::{KeyStore, KeyStoreError, PublicKeyFormat, SecretKey32};
use qrlive_pipeline::EnhanceOptions;
use serde_json::Value;
use std::sync::Arc;

#[test]
fn test_restored_snapshot_keeps_signing_identity() {
    let site = TestSite::new();
    let wrapping_key = SecretKey32::random();
    let path = temp_snapshot_path();

    let producer = site.pipeline_with_store(Arc::new(KeyStore::with_wrapping_key(wrapping_key.clone())));
    let key_id = producer.ensure_signing_key().unwrap();
    let before = producer
        .enhance(&live_payload(1), &EnhanceOptions::signed())
        .unwrap()
        .payload
        .to_wire_json()
        .unwrap();
    producer.key_store().save_snapshot(&path).unwrap();

    let restored = Arc::new(KeyStore::load_snapshot(&path, wrapping_key).unwrap());
    std::fs::remove_file(&path).unwrap();
    assert!(restored.get_key_info(&key_id).unwrap().has_private_key);

    // The restarted instance signs with the restored key and still verifies old payloads
    let restarted = site.pipeline_with_store(restored);
    assert_eq!(restarted.ensure_signing_key().unwrap(), key_id);
    let context = restarted.verification_context().with_identity(IDENTITY_HASH);
    assert!(restarted.verify(&before, &context).is_trusted(true));

    let after = restarted
        .enhance(&live_payload(2), &EnhanceOptions::signed())
        .unwrap()
        .payload
        .to_wire_json()
        .unwrap();
    assert!(producer.verify(&after, &producer.verification_context()).signature_verified);
}

#[test]
fn test_snapshot_with_wrong_wrapping_key_fails() {
    let path = temp_snapshot_path();
    let store = KeyStore::with_wrapping_key(SecretKey32::random());
    store
        .generate_keypair(qrlive_core::KeyAlgorithm::Ecdsa, 256, "qr_signing")
        .unwrap();
    store.save_snapshot(&path).unwrap();

    let result = KeyStore::load_snapshot(&path, SecretKey32::random());
    std::fs::remove_file(&path).unwrap();
    assert!(matches!(result, Err(KeyStoreError::KeyDecryption(_))));
}

#[test]
fn test_imported_public_key_verifies_only() {
    let site = TestSite::new();
    let producer = site.pipeline();
    let verifier = site.pipeline();

    let key_id = producer.ensure_signing_key().unwrap();
    let public = producer.key_store().get_public_key(&key_id).unwrap();
    verifier
        .key_store()
        .import_public_key(&key_id, public, "qr_verification")
        .unwrap();

    let wire = producer
        .enhance(&live_payload(1), &EnhanceOptions::signed())
        .unwrap()
        .payload
        .to_wire_json()
        .unwrap();
    let result = verifier.verify(&wire, &verifier.verification_context().with_identity(IDENTITY_HASH));
    assert!(result.is_trusted(true));

    assert!(matches!(
        verifier.key_store().get_private_key(&key_id),
        Err(KeyStoreError::PublicKeyOnly(_))
    ));
    // The verifier's own signing key is distinct from the imported one
    assert_ne!(verifier.ensure_signing_key().unwrap(), key_id);
}

#[test]
fn test_import_rejects_mismatched_key_id() {
    let producer = TestSite::new().pipeline();
    let key_id = producer.ensure_signing_key().unwrap();
    let public = producer.key_store().get_public_key(&key_id).unwrap();

    let verifier = KeyStore::new();
    let result = verifier.import_public_key("not-the-fingerprint", public, "qr_verification");
    assert!(result.is_err());
    assert!(verifier.list_keys().is_empty());
}

#[test]
fn test_public_key_exports() {
    let pipeline = TestSite::new().pipeline();
    let key_id = pipeline.ensure_signing_key().unwrap();
    let store = pipeline.key_store();

    let pem = String::from_utf8(store.export_public_key(&key_id, PublicKeyFormat::Pem).unwrap()).unwrap();
    assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));

    let der = store.export_public_key(&key_id, PublicKeyFormat::Der).unwrap();
    assert_eq!(der, store.get_public_key(&key_id).unwrap().der);

    let json: Value = serde_json::from_slice(&store.export_public_key(&key_id, PublicKeyFormat::Json).unwrap()).unwrap();
    assert_eq!(json["key_id"], Value::String(key_id.clone()));
    assert_eq!(json["algorithm"], Value::String("ecdsa".to_string()));
    assert!(json["public_key"].as_str().is_some_and(|encoded| !encoded.is_empty()));
}
