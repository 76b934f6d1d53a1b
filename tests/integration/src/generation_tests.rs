//! Live Generation - Loop Behaviour Under Load
//!
//! # Test Scenarios
//!
//! 1. **Steady Generation**: ticks emit verifiable payloads with sequence numbers from 1
//! 2. **Concurrent Verification**: payloads are verified on the blocking pool while generation continues
//! 3. **Observer Isolation**: a failing observer never stops delivery to the others
//! 4. **Cooperative Stop**: stop waits for the in-flight tick and the task exits

use crate::test_utils::{ecdsa_config, live_source, IDENTITY_HASH};
use qrlive_core::{EnhancedPayload, PipelineConfig};
use qrlive_pipeline::{EnhanceOptions, LiveGenerator, PayloadPipeline, PayloadSource};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn shared_pipeline(config: PipelineConfig) -> Arc<PayloadPipeline> {
    Arc::new(PayloadPipeline::new(config).expect("Failed to build pipeline"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_generation_emits_verifiable_sequence() {
    qrlive_core::logging::try_init();
    let pipeline = shared_pipeline(ecdsa_config());
    let generator = LiveGenerator::new(Arc::clone(&pipeline), live_source());
    assert_eq!(generator.interval(), Duration::from_millis(20));

    let emitted = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&emitted);
    generator.add_observer(Arc::new(move |payload: &EnhancedPayload, wire: &str| -> anyhow::Result<()> {
        sink.lock().unwrap().push((payload.base.sequence_number, wire.to_string()));
        Ok(())
    }));

    let handle = generator.start().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = handle.stop().await.unwrap();

    let emitted = emitted.lock().unwrap().clone();
    assert!(emitted.len() >= 2, "only {} payloads emitted", emitted.len());
    assert_eq!(stats.ticks, emitted.len() as u64);
    assert_eq!(stats.failures, 0);
    assert_eq!(stats.last_sequence, emitted.last().unwrap().0);

    let sequences: Vec<u64> = emitted.iter().map(|(sequence, _)| *sequence).collect();
    let expected: Vec<u64> = (1..=sequences.len() as u64).collect();
    assert_eq!(sequences, expected);

    let context = pipeline.verification_context().with_identity(IDENTITY_HASH);
    for (sequence, wire) in &emitted {
        let result = pipeline.verify(wire, &context);
        assert!(result.hmac_verified, "tick {} failed HMAC", sequence);
        assert!(result.signature_verified, "tick {} failed signature", sequence);
        assert!(result.is_trusted(true), "tick {} not trusted", sequence);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_verification_during_generation() {
    let mut config = ecdsa_config();
    config.encryption.enabled = true;
    let pipeline = shared_pipeline(config);
    let generator = LiveGenerator::new(Arc::clone(&pipeline), live_source());

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    generator.add_observer(Arc::new(move |_: &EnhancedPayload, wire: &str| -> anyhow::Result<()> {
        tx.send(wire.to_string())?;
        Ok(())
    }));

    let handle = generator.start().unwrap();
    let mut checks = Vec::new();
    for _ in 0..6 {
        let wire = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for payload")
            .expect("Observer channel closed");
        let verifier = Arc::clone(&pipeline);
        checks.push(tokio::task::spawn_blocking(move || {
            verifier.verify(&wire, &verifier.verification_context().with_identity(IDENTITY_HASH))
        }));
    }

    for check in checks {
        let result = check.await.unwrap();
        assert!(result.valid_json);
        assert!(result.encrypted);
        assert!(result.hmac_verified);
        assert!(result.signature_verified);
        assert!(result.identity_verified);
    }

    let stats = handle.stop().await.unwrap();
    assert!(stats.ticks >= 6);
    assert_eq!(stats.observer_failures, 0);

    let metrics = pipeline.metrics();
    assert!(metrics.payloads_enhanced >= 6);
    assert_eq!(metrics.verification_failures, 0);
    assert_eq!(metrics.encryption_degradations, 0);
}

#[tokio::test]
async fn test_failing_observer_is_isolated() {
    let pipeline = shared_pipeline(ecdsa_config());
    let generator = LiveGenerator::new(pipeline, live_source())
        .with_interval(Duration::from_millis(10))
        .with_options(EnhanceOptions::integrity_only());

    let delivered = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&delivered);
    generator.add_observer(Arc::new(|_: &EnhancedPayload, _: &str| -> anyhow::Result<()> {
        anyhow::bail!("display disconnected")
    }));
    generator.add_observer(Arc::new(move |_: &EnhancedPayload, _: &str| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    let handle = generator.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = handle.stop().await.unwrap();

    assert!(stats.ticks >= 1);
    assert_eq!(stats.observer_failures, stats.ticks);
    assert_eq!(delivered.load(Ordering::SeqCst), stats.ticks);
}

#[tokio::test]
async fn test_source_failures_do_not_stop_generation() {
    let pipeline = shared_pipeline(ecdsa_config());
    let inner = live_source();
    let source: Arc<dyn PayloadSource> = Arc::new(move |sequence: u64| {
        if sequence % 2 == 0 {
            anyhow::bail!("time server timeout at tick {}", sequence)
        }
        inner.next_payload(sequence)
    });
    let generator = LiveGenerator::new(pipeline, source).with_interval(Duration::from_millis(10));

    let handle = generator.start().unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    let stats = handle.stop().await.unwrap();

    assert!(stats.ticks >= 1);
    assert!(stats.failures >= 1);
    assert_eq!(stats.last_sequence % 2, 1);
}

#[tokio::test]
async fn test_stop_and_restart() {
    let pipeline = shared_pipeline(ecdsa_config());
    let generator = LiveGenerator::new(pipeline, live_source()).with_interval(Duration::from_millis(10));

    let handle = generator.start().unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    let first = timeout(Duration::from_secs(5), handle.stop())
        .await
        .expect("Stop did not complete")
        .unwrap();
    assert!(!generator.is_running());
    assert!(first.ticks >= 1);

    let handle = generator.start().unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    let second = handle.stop().await.unwrap();
    assert!(second.ticks > first.ticks);
}

#[tokio::test]
async fn test_removed_observer_receives_nothing() {
    let pipeline = shared_pipeline(ecdsa_config());
    let generator = LiveGenerator::new(pipeline, live_source()).with_interval(Duration::from_millis(10));

    let delivered = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&delivered);
    let id = generator.add_observer(Arc::new(move |_: &EnhancedPayload, _: &str| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    assert!(generator.remove_observer(id));

    let handle = generator.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = handle.stop().await.unwrap();

    assert!(stats.ticks >= 1);
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
}
