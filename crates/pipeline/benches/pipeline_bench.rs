//! Payload Pipeline Performance Benchmarks
//!
//! Measures the per-tick cost of the enhancement protocol:
//! - Canonical encoding of base payloads of growing size
//! - Enhancement with HMAC only, with ECDSA signatures and with encryption
//! - Verification of the emitted wire JSON

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use qrlive_core::{BasePayload, KeyAlgorithm, PipelineConfig};
use qrlive_pipeline::{EnhanceOptions, PayloadPipeline};
use serde_json::{Map, Value};

/// Base payload with `entries` user data members.
fn generate_payload(entries: usize) -> BasePayload {
    let mut user_data = Map::new();
    for i in 0..entries {
        user_data.insert(format!("field-{:04}", i), Value::String(format!("value-{:08}", i)));
    }
    BasePayload::new(Utc::now().to_rfc3339(), "abc123", 1)
        .with_blockchain_hash("bitcoin", "000000000000000000024bead8df69990852c202db0e0097c1a12ea637d7e96a")
        .with_blockchain_hash("ethereum", "0x88e96d4537bea4d9c05d12549907b32561d3bf31f45aae734cdc119f13406cb6")
        .with_user_data(user_data)
}

fn ecdsa_pipeline() -> PayloadPipeline {
    let mut config = PipelineConfig::default_config();
    config.signing.algorithm = KeyAlgorithm::Ecdsa;
    config.signing.key_size = 256;
    PayloadPipeline::new(config).unwrap()
}

/// Benchmark: canonical bytes of payloads with varying user data size
fn bench_canonicalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("canonicalize");
    for entries in [0usize, 16, 256] {
        let payload = generate_payload(entries);
        group.bench_with_input(BenchmarkId::from_parameter(entries), &payload, |b, payload| {
            b.iter(|| black_box(payload.canonical_bytes().unwrap()))
        });
    }
    group.finish();
}

/// Benchmark: enhancement with each layer combination
fn bench_enhance(c: &mut Criterion) {
    let pipeline = ecdsa_pipeline();
    pipeline.ensure_signing_key().unwrap();
    let payload = generate_payload(16);

    let variants = [
        ("integrity_only", EnhanceOptions::integrity_only()),
        ("signed", EnhanceOptions::signed()),
        ("signed_encrypted", EnhanceOptions::signed().with_encryption(["user_data"])),
    ];

    let mut group = c.benchmark_group("enhance");
    for (name, options) in variants.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(name), options, |b, options| {
            b.iter(|| black_box(pipeline.enhance(&payload, options).unwrap()))
        });
    }
    group.finish();
}

/// Benchmark: verification of a signed payload
fn bench_verify(c: &mut Criterion) {
    let pipeline = ecdsa_pipeline();
    let wire = pipeline
        .enhance(&generate_payload(16), &EnhanceOptions::signed())
        .unwrap()
        .payload
        .to_wire_json()
        .unwrap();
    let context = pipeline.verification_context();

    c.bench_function("verify_signed", |b| {
        b.iter(|| black_box(pipeline.verify(&wire, &context)))
    });
}

criterion_group!(benches, bench_canonicalize, bench_enhance, bench_verify);
criterion_main!(benches);
