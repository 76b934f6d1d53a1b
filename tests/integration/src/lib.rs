//! Cross-crate integration tests for the QR Live Protocol
//!
//! This test suite validates:
//! - The live generation loop driving the full enhancement protocol
//! - Concurrent verification while payloads are being generated
//! - Key domains across independent pipeline instances
//! - Key store persistence and out-of-band public key distribution

pub mod test_utils;

#[cfg(test)]
mod generation_tests;

#[cfg(test)]
mod cross_instance_tests;

#[cfg(test)]
mod key_distribution_tests;
