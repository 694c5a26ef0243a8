//! Pruning of old slashing protection history behind a low watermark.

use super::{
    dao::{self, choose_larger, ValidatorId},
    Error, SlashingProtection,
};
use crate::metrics::SigningMetrics;
use rocket::{
    tokio::{select, task, time},
    Shutdown,
};
use rusqlite::Connection;
use std::{sync::Arc, time::Duration};

/// How much history to retain per validator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PruningPolicy {
    epochs_to_keep: u64,
    slots_per_epoch: u64,
}

impl PruningPolicy {
    pub fn new(epochs_to_keep: u64, slots_per_epoch: u64) -> Result<Self, Error> {
        if epochs_to_keep == 0 {
            return Err(Error::InvalidPruningPolicy("epochs to keep must be positive"));
        }
        if slots_per_epoch == 0 {
            return Err(Error::InvalidPruningPolicy("slots per epoch must be positive"));
        }
        Ok(Self {
            epochs_to_keep,
            slots_per_epoch,
        })
    }

    fn slots_to_keep(&self) -> u64 {
        self.epochs_to_keep.saturating_mul(self.slots_per_epoch)
    }
}

/// When the background pruner runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PruningSchedule {
    pub policy: PruningPolicy,
    pub period: Duration,
    /// Whether the first run happens immediately instead of after `period`.
    pub at_boot: bool,
}

impl PruningSchedule {
    fn first_run(&self, now: time::Instant) -> time::Instant {
        if self.at_boot {
            now
        } else {
            now + self.period
        }
    }
}

/// Row counts removed by pruning.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PruneReport {
    pub validators: usize,
    pub failures: usize,
    pub blocks: usize,
    pub attestations: usize,
}

/// Prunes one validator's history and raises its watermark to the new
/// boundary. Must run inside its own transaction.
///
/// The most recent block and attestation are always at or above the
/// boundary, so they survive.
pub fn prune_validator(
    conn: &Connection,
    id: ValidatorId,
    policy: &PruningPolicy,
) -> Result<PruneReport, Error> {
    let existing = dao::find_watermark(conn, id)?;
    let mut watermark = existing;
    let mut report = PruneReport {
        validators: 1,
        ..Default::default()
    };

    if let Some(latest) = dao::find_max_block_slot(conn, id)? {
        let retain_from = latest.saturating_sub(policy.slots_to_keep());
        if retain_from > 0 {
            report.blocks = dao::delete_blocks_below(conn, id, retain_from)?;
            watermark.slot = choose_larger(watermark.slot, Some(retain_from));
        }
    }

    if let Some(latest) = dao::find_max_target_epoch(conn, id)? {
        let retain_from = latest.saturating_sub(policy.epochs_to_keep);
        if retain_from > 0 {
            report.attestations = dao::delete_attestations_below(conn, id, retain_from)?;
            watermark.target_epoch = choose_larger(watermark.target_epoch, Some(retain_from));
            // Source floor comes from the oldest retained attestation.
            if let Some(nearest) = dao::find_nearest_attestation_from(conn, id, retain_from)? {
                watermark.source_epoch =
                    choose_larger(watermark.source_epoch, Some(nearest.source_epoch));
            }
        }
    }

    if watermark != existing {
        dao::upsert_watermark(conn, id, &watermark)?;
        tracing::debug!(validator_id = id.0, ?watermark, "raised low watermark");
    }
    Ok(report)
}

impl PruneReport {
    pub(super) fn add(&mut self, other: Self) {
        self.validators += other.validators;
        self.failures += other.failures;
        self.blocks += other.blocks;
        self.attestations += other.attestations;
    }
}

/// Runs pruning once every `period` until the server shuts down, starting
/// immediately if the schedule runs at boot. Each run happens on a blocking
/// thread.
pub async fn run(
    protection: Arc<SlashingProtection>,
    metrics: Arc<SigningMetrics>,
    schedule: PruningSchedule,
    mut shutdown: Shutdown,
) {
    let policy = schedule.policy;
    let start = schedule.first_run(time::Instant::now());
    let mut interval = time::interval_at(start, schedule.period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        select! {
            _ = interval.tick() => {}
            _ = &mut shutdown => break,
        }

        let protection = protection.clone();
        match task::spawn_blocking(move || protection.prune(&policy)).await {
            Ok(Ok(report)) => {
                metrics.record_prune(report.failures);
                tracing::info!(?report, "pruned slashing protection database");
            }
            Ok(Err(err)) => {
                metrics.record_prune(1);
                tracing::warn!(?err, "failed to prune slashing protection database");
            }
            Err(err) => {
                metrics.record_prune(1);
                tracing::error!(?err, "pruning task panicked");
            }
        }
    }
    tracing::debug!("pruner stopped");
}
