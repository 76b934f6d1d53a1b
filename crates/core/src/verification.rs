//! Verification outcome and the externally supplied comparison values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::payload::parse_timestamp;

/// Per-layer verification outcome. Never mutated once returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub valid_json: bool,
    pub identity_verified: bool,
    pub time_verified: bool,
    pub blockchain_verified: bool,
    pub signature_verified: bool,
    pub hmac_verified: bool,
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl VerificationResult {
    /// Result for input that could not be parsed; every check is false.
    pub fn malformed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Overall trust decision.
    ///
    /// The integrity tag dominates: without a valid HMAC the payload is never
    /// trusted, whatever else passed.
    pub fn is_trusted(&self, require_signature: bool) -> bool {
        self.valid_json
            && self.hmac_verified
            && self.identity_verified
            && self.time_verified
            && (!require_signature || self.signature_verified)
    }
}

/// Values the orchestrator's collaborators resolved before verification.
#[derive(Debug, Clone)]
pub struct VerificationContext {
    /// Identity hash this verifier expects
    pub expected_identity_hash: Option<String>,
    /// Chain hashes currently observed by the verifier
    pub current_blockchain_hashes: BTreeMap<String, String>,
    /// Reference time for the drift check
    pub now: DateTime<Utc>,
    /// Maximum accepted distance between payload time and `now`
    pub max_time_drift: Duration,
}

impl VerificationContext {
    pub fn new(max_time_drift_secs: u64) -> Self {
        Self {
            expected_identity_hash: None,
            current_blockchain_hashes: BTreeMap::new(),
            now: Utc::now(),
            max_time_drift: Duration::from_secs(max_time_drift_secs),
        }
    }

    pub fn with_identity(mut self, identity_hash: impl Into<String>) -> Self {
        self.expected_identity_hash = Some(identity_hash.into());
        self
    }

    pub fn with_blockchain_hashes(mut self, hashes: BTreeMap<String, String>) -> Self {
        self.current_blockchain_hashes = hashes;
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn identity_matches(&self, identity_hash: &str) -> bool {
        self.expected_identity_hash
            .as_deref()
            .is_some_and(|expected| expected == identity_hash)
    }

    /// True if `timestamp` parses and lies within the drift window around `now`.
    pub fn time_within_drift(&self, timestamp: &str) -> bool {
        match parse_timestamp(timestamp) {
            Some(ts) => {
                let diff = self.now.signed_duration_since(ts);
                u128::from(diff.num_milliseconds().unsigned_abs()) <= self.max_time_drift.as_millis()
            }
            None => false,
        }
    }

    /// True if at least one chain hash in the payload matches the current view.
    pub fn blockchain_matches(&self, hashes: &BTreeMap<String, String>) -> bool {
        hashes
            .iter()
            .any(|(chain, hash)| self.current_blockchain_hashes.get(chain) == Some(hash))
    }
}
