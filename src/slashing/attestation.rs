//! Double vote and surround vote protection.

use super::{
    dao::{self, LowWatermark, SignedAttestation, ValidatorId},
    Decision, Error, Violation,
};
use crate::types::Root;
use rusqlite::Connection;

/// Decides whether `attestation` may be signed and records it when allowed.
///
/// Must run inside the transaction that commits the decision.
pub fn check_and_record(
    conn: &Connection,
    id: ValidatorId,
    attestation: &SignedAttestation,
    watermark: &LowWatermark,
) -> Result<Decision, Error> {
    let decision = evaluate(conn, id, attestation, watermark)?;
    if decision == Decision::Allow {
        dao::insert_attestation(conn, id, attestation)?;
    }
    Ok(decision)
}

/// Checks a live attestation signing request against the validator's stored
/// watermark and history.
pub fn may_vote(
    conn: &Connection,
    id: ValidatorId,
    source_epoch: u64,
    target_epoch: u64,
    signing_root: Root,
) -> Result<Decision, Error> {
    let watermark = dao::find_watermark(conn, id)?;
    check_and_record(
        conn,
        id,
        &SignedAttestation {
            source_epoch,
            target_epoch,
            signing_root: Some(signing_root),
        },
        &watermark,
    )
}

fn evaluate(
    conn: &Connection,
    id: ValidatorId,
    attestation: &SignedAttestation,
    watermark: &LowWatermark,
) -> Result<Decision, Error> {
    let SignedAttestation {
        source_epoch: source,
        target_epoch: target,
        signing_root,
    } = *attestation;

    if source > target {
        tracing::warn!(validator_id = id.0, source, target, "attestation source after target");
        return Ok(Decision::Deny(Violation::InvalidRange));
    }

    let below_target = matches!(watermark.target_epoch, Some(floor) if target < floor);
    let below_source = matches!(watermark.source_epoch, Some(floor) if source < floor);
    if below_target || below_source {
        tracing::warn!(
            validator_id = id.0,
            source,
            target,
            watermark_source = ?watermark.source_epoch,
            watermark_target = ?watermark.target_epoch,
            "attestation below watermark"
        );
        return Ok(Decision::Deny(Violation::BelowWatermark));
    }

    if let Some(existing) = dao::find_attestation(conn, id, target)? {
        if existing.signing_root == signing_root {
            return Ok(Decision::Idempotent);
        }
        tracing::warn!(
            validator_id = id.0,
            source,
            target,
            existing = ?existing.signing_root,
            requested = ?signing_root,
            "conflicting attestation already signed"
        );
        return Ok(Decision::Deny(Violation::DoubleVote));
    }

    let surround = match dao::find_surrounding(conn, id, source, target)? {
        Some(existing) => Some(existing),
        None => dao::find_surrounded(conn, id, source, target)?,
    };
    if let Some(existing) = surround {
        tracing::warn!(
            validator_id = id.0,
            source,
            target,
            existing_source = existing.source_epoch,
            existing_target = existing.target_epoch,
            existing = ?existing.signing_root,
            "surround vote"
        );
        return Ok(Decision::Deny(Violation::SurroundVote));
    }

    Ok(Decision::Allow)
}
