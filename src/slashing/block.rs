//! Double block protection.

use super::{
    dao::{self, LowWatermark, SignedBlock, ValidatorId},
    Decision, Error, Violation,
};
use crate::types::Root;
use rusqlite::Connection;

/// Decides whether `block` may be signed and records it when allowed.
///
/// Must run inside the transaction that commits the decision.
pub fn check_and_record(
    conn: &Connection,
    id: ValidatorId,
    block: &SignedBlock,
    watermark: &LowWatermark,
) -> Result<Decision, Error> {
    let decision = evaluate(conn, id, block, watermark)?;
    if decision == Decision::Allow {
        dao::insert_block(conn, id, block)?;
    }
    Ok(decision)
}

/// Checks a live block signing request against the validator's stored
/// watermark and history.
pub fn may_block(
    conn: &Connection,
    id: ValidatorId,
    slot: u64,
    signing_root: Root,
) -> Result<Decision, Error> {
    let watermark = dao::find_watermark(conn, id)?;
    check_and_record(
        conn,
        id,
        &SignedBlock {
            slot,
            signing_root: Some(signing_root),
        },
        &watermark,
    )
}

fn evaluate(
    conn: &Connection,
    id: ValidatorId,
    block: &SignedBlock,
    watermark: &LowWatermark,
) -> Result<Decision, Error> {
    if matches!(watermark.slot, Some(floor) if block.slot <= floor) {
        tracing::warn!(
            validator_id = id.0,
            slot = block.slot,
            watermark = ?watermark.slot,
            "block below watermark"
        );
        return Ok(Decision::Deny(Violation::BelowWatermark));
    }

    match dao::find_block(conn, id, block.slot)? {
        Some(existing) if existing.signing_root == block.signing_root => Ok(Decision::Idempotent),
        Some(existing) => {
            tracing::warn!(
                validator_id = id.0,
                slot = block.slot,
                existing = ?existing.signing_root,
                requested = ?block.signing_root,
                "conflicting block already signed"
            );
            Ok(Decision::Deny(Violation::DoubleBlock))
        }
        None => Ok(Decision::Allow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        slashing::{database::Database, SlashingProtectionConfig},
        types::PublicKey,
    };

    fn validator() -> (tempfile::TempDir, Database, ValidatorId) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(
            &dir.path().join("slashing.sqlite"),
            &SlashingProtectionConfig::default(),
        )
        .unwrap();
        let id = db
            .transaction(|tx| dao::insert_validator(tx, &PublicKey([1; 48])))
            .unwrap();
        (dir, db, id)
    }

    #[test]
    fn no_double_block() {
        let (_dir, db, id) = validator();
        let sign = |root| {
            db.transaction(|tx| may_block(tx, id, 100, Root([root; 32])))
                .unwrap()
        };

        assert_eq!(sign(0xaa), Decision::Allow);
        assert_eq!(sign(0xaa), Decision::Idempotent);
        assert_eq!(sign(0xbb), Decision::Deny(Violation::DoubleBlock));
        assert_eq!(sign(0xaa), Decision::Idempotent);
    }

    #[test]
    fn denies_at_or_below_watermark() {
        let (_dir, db, id) = validator();
        db.transaction(|tx| {
            dao::upsert_watermark(
                tx,
                id,
                &LowWatermark {
                    slot: Some(64),
                    ..Default::default()
                },
            )
        })
        .unwrap();

        for (slot, decision) in [
            (63, Decision::Deny(Violation::BelowWatermark)),
            (64, Decision::Deny(Violation::BelowWatermark)),
            (65, Decision::Allow),
        ] {
            assert_eq!(
                db.transaction(|tx| may_block(tx, id, slot, Root([1; 32])))
                    .unwrap(),
                decision,
            );
        }
    }

    #[test]
    fn unknown_root_conflicts_with_any_request() {
        let (_dir, db, id) = validator();
        db.transaction(|tx| {
            dao::insert_block(
                tx,
                id,
                &SignedBlock {
                    slot: 7,
                    signing_root: None,
                },
            )
        })
        .unwrap();

        assert_eq!(
            db.transaction(|tx| may_block(tx, id, 7, Root([1; 32])))
                .unwrap(),
            Decision::Deny(Violation::DoubleBlock),
        );
    }

    #[test]
    fn denied_requests_are_not_recorded() {
        let (_dir, db, id) = validator();
        db.transaction(|tx| may_block(tx, id, 5, Root([1; 32])))
            .unwrap();
        db.transaction(|tx| may_block(tx, id, 5, Root([2; 32])))
            .unwrap();

        let blocks = db.transaction(|tx| dao::find_blocks(tx, id)).unwrap();
        assert_eq!(
            blocks,
            [SignedBlock {
                slot: 5,
                signing_root: Some(Root([1; 32])),
            }]
        );
    }
}
