//! Signing counters.

use rocket::serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters shared between the signing service and the pruner.
#[derive(Debug, Default)]
pub struct SigningMetrics {
    loaded_signers: AtomicUsize,
    signed_blocks: AtomicU64,
    signed_attestations: AtomicU64,
    other_signatures: AtomicU64,
    slashing_refusals: AtomicU64,
    prune_runs: AtomicU64,
    prune_failures: AtomicU64,
}

/// What kind of message was signed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Signed {
    Block,
    Attestation,
    Other,
}

/// A point-in-time copy of the counters.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct MetricsSnapshot {
    pub loaded_signers: usize,
    pub registered_validators: usize,
    pub signed_blocks: u64,
    pub signed_attestations: u64,
    pub other_signatures: u64,
    pub slashing_refusals: u64,
    pub prune_runs: u64,
    pub prune_failures: u64,
}

impl SigningMetrics {
    pub fn set_loaded_signers(&self, count: usize) {
        self.loaded_signers.store(count, Ordering::Relaxed);
    }

    pub fn record_signature(&self, signed: Signed) {
        let counter = match signed {
            Signed::Block => &self.signed_blocks,
            Signed::Attestation => &self.signed_attestations,
            Signed::Other => &self.other_signatures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refusal(&self) {
        self.slashing_refusals.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a pruning run and the number of validators it failed to prune.
    pub fn record_prune(&self, failures: usize) {
        self.prune_runs.fetch_add(1, Ordering::Relaxed);
        self.prune_failures.fetch_add(failures as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, registered_validators: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            loaded_signers: self.loaded_signers.load(Ordering::Relaxed),
            registered_validators,
            signed_blocks: self.signed_blocks.load(Ordering::Relaxed),
            signed_attestations: self.signed_attestations.load(Ordering::Relaxed),
            other_signatures: self.other_signatures.load(Ordering::Relaxed),
            slashing_refusals: self.slashing_refusals.load(Ordering::Relaxed),
            prune_runs: self.prune_runs.load(Ordering::Relaxed),
            prune_failures: self.prune_failures.load(Ordering::Relaxed),
        }
    }
}
