//! The EIP-3076 slashing protection interchange format.

use super::{
    attestation, block,
    dao::{self, choose_larger, LowWatermark, SignedAttestation, SignedBlock, ValidatorId},
    Decision, Error, Violation,
};
use crate::{
    serialization::Str,
    types::{PublicKey, Root},
};
use rocket::serde::{Deserialize, Serialize};
use rusqlite::Connection;

/// The only interchange format version understood.
pub const INTERCHANGE_VERSION: &str = "5";

/// A complete interchange document.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct Interchange {
    pub metadata: Metadata,
    pub data: Vec<ValidatorData>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interchange_format: Option<Format>,
    #[serde(alias = "interchange_version")]
    pub interchange_format_version: String,
    pub genesis_validators_root: Root,
}

/// Whether a document carries every signed record or only the records
/// needed to reconstruct watermarks.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(crate = "rocket::serde", rename_all = "lowercase")]
pub enum Format {
    #[default]
    Complete,
    Minimal,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct ValidatorData {
    pub pubkey: PublicKey,
    #[serde(default)]
    pub signed_blocks: Vec<BlockRecord>,
    #[serde(default)]
    pub signed_attestations: Vec<AttestationRecord>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct BlockRecord {
    pub slot: Str<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_root: Option<Root>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct AttestationRecord {
    pub source_epoch: Str<u64>,
    pub target_epoch: Str<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_root: Option<Root>,
}

impl From<SignedBlock> for BlockRecord {
    fn from(block: SignedBlock) -> Self {
        Self {
            slot: Str(block.slot),
            signing_root: block.signing_root,
        }
    }
}

impl From<&BlockRecord> for SignedBlock {
    fn from(record: &BlockRecord) -> Self {
        Self {
            slot: *record.slot,
            signing_root: record.signing_root,
        }
    }
}

impl From<SignedAttestation> for AttestationRecord {
    fn from(attestation: SignedAttestation) -> Self {
        Self {
            source_epoch: Str(attestation.source_epoch),
            target_epoch: Str(attestation.target_epoch),
            signing_root: attestation.signing_root,
        }
    }
}

impl From<&AttestationRecord> for SignedAttestation {
    fn from(record: &AttestationRecord) -> Self {
        Self {
            source_epoch: *record.source_epoch,
            target_epoch: *record.target_epoch,
            signing_root: record.signing_root,
        }
    }
}

/// Options for exporting the database.
#[derive(Clone, Debug, Default)]
pub struct ExportOptions {
    pub format: Format,
    /// Validators to export; `None` exports every validator.
    pub public_keys: Option<Vec<PublicKey>>,
}

/// The outcome of an import.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct ImportReport {
    pub validators: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub conflicts: Vec<ImportConflict>,
}

impl ImportReport {
    fn reject(&mut self, pubkey: PublicKey, record: ConflictRecord, violation: Violation) {
        tracing::warn!(%pubkey, ?record, reason = violation.reason(), "rejected imported record");
        self.rejected += 1;
        self.conflicts.push(ImportConflict {
            pubkey,
            record,
            reason: violation.reason(),
        });
    }
}

/// An imported record that was rejected.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct ImportConflict {
    pub pubkey: PublicKey,
    #[serde(flatten)]
    pub record: ConflictRecord,
    pub reason: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(crate = "rocket::serde", untagged)]
pub enum ConflictRecord {
    Block(BlockRecord),
    Attestation(AttestationRecord),
}

/// Checks the document header before anything is written.
pub(super) fn check_version(metadata: &Metadata) -> Result<(), Error> {
    if metadata.interchange_format_version != INTERCHANGE_VERSION {
        return Err(Error::UnsupportedInterchangeVersion(
            metadata.interchange_format_version.clone(),
        ));
    }
    Ok(())
}

/// Checks that every slot and epoch in the document fits the database.
pub(super) fn check_ranges(interchange: &Interchange) -> Result<(), Error> {
    for data in &interchange.data {
        for record in &data.signed_blocks {
            dao::sql_int(*record.slot)?;
        }
        for record in &data.signed_attestations {
            dao::sql_int(*record.source_epoch)?;
            dao::sql_int(*record.target_epoch)?;
        }
    }
    Ok(())
}

/// Imports one validator's records inside the caller's transaction.
///
/// Records are checked with the same rules as live signing, except that
/// the stored watermark does not apply: imported history may sit below
/// it. A record without a signing root at a slot or target epoch that is
/// already recorded only anchors the watermark, so it counts as a
/// duplicate. The watermark is then raised to the highest well-formed
/// incoming values, including rejected ones.
pub(super) fn import_validator(
    conn: &Connection,
    id: ValidatorId,
    data: &ValidatorData,
) -> Result<ImportReport, Error> {
    let mut report = ImportReport {
        validators: 1,
        ..Default::default()
    };
    let unconstrained = LowWatermark::default();
    let mut incoming = LowWatermark::default();

    for record in &data.signed_blocks {
        let signed = SignedBlock::from(record);
        incoming.slot = choose_larger(incoming.slot, Some(signed.slot));
        match block::check_and_record(conn, id, &signed, &unconstrained)? {
            Decision::Allow => report.accepted += 1,
            Decision::Idempotent => report.duplicates += 1,
            Decision::Deny(Violation::DoubleBlock) if signed.signing_root.is_none() => {
                report.duplicates += 1
            }
            Decision::Deny(violation) => {
                report.reject(data.pubkey, ConflictRecord::Block(record.clone()), violation)
            }
        }
    }

    for record in &data.signed_attestations {
        let signed = SignedAttestation::from(record);
        if signed.source_epoch <= signed.target_epoch {
            incoming.source_epoch = choose_larger(incoming.source_epoch, Some(signed.source_epoch));
            incoming.target_epoch = choose_larger(incoming.target_epoch, Some(signed.target_epoch));
        }
        match attestation::check_and_record(conn, id, &signed, &unconstrained)? {
            Decision::Allow => report.accepted += 1,
            Decision::Idempotent => report.duplicates += 1,
            Decision::Deny(Violation::DoubleVote) if signed.signing_root.is_none() => {
                report.duplicates += 1
            }
            Decision::Deny(violation) => report.reject(
                data.pubkey,
                ConflictRecord::Attestation(record.clone()),
                violation,
            ),
        }
    }

    let existing = dao::find_watermark(conn, id)?;
    let merged = existing.merge(incoming);
    if merged != existing {
        dao::upsert_watermark(conn, id, &merged)?;
    }

    Ok(report)
}

/// Exports one validator's history, or `None` if it has none.
pub(super) fn export_validator(
    conn: &Connection,
    id: ValidatorId,
    pubkey: PublicKey,
    format: Format,
) -> Result<Option<ValidatorData>, Error> {
    let blocks = dao::find_blocks(conn, id)?;
    let attestations = dao::find_attestations(conn, id)?;

    let data = match format {
        Format::Complete => ValidatorData {
            pubkey,
            signed_blocks: blocks.into_iter().map(BlockRecord::from).collect(),
            signed_attestations: attestations.into_iter().map(AttestationRecord::from).collect(),
        },
        Format::Minimal => {
            let watermark = dao::find_watermark(conn, id)?;
            let slot = blocks
                .iter()
                .map(|block| block.slot)
                .fold(watermark.slot, |max, slot| choose_larger(max, Some(slot)));
            let source = attestations
                .iter()
                .map(|attestation| attestation.source_epoch)
                .fold(watermark.source_epoch, |max, epoch| choose_larger(max, Some(epoch)));
            let target = attestations
                .iter()
                .map(|attestation| attestation.target_epoch)
                .fold(watermark.target_epoch, |max, epoch| choose_larger(max, Some(epoch)));

            ValidatorData {
                pubkey,
                signed_blocks: slot
                    .map(|slot| BlockRecord {
                        slot: Str(slot),
                        signing_root: None,
                    })
                    .into_iter()
                    .collect(),
                signed_attestations: match (source, target) {
                    (Some(source), Some(target)) if source <= target => vec![AttestationRecord {
                        source_epoch: Str(source),
                        target_epoch: Str(target),
                        signing_root: None,
                    }],
                    _ => Vec::new(),
                },
            }
        }
    };

    if data.signed_blocks.is_empty() && data.signed_attestations.is_empty() {
        return Ok(None);
    }
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocket::serde::json::{serde_json, serde_json::json};

    #[test]
    fn parses_interchange_document() {
        let document = serde_json::from_value::<Interchange>(json!({
            "metadata": {
                "interchange_format_version": "5",
                "genesis_validators_root": format!("0x{}", "04".repeat(32)),
            },
            "data": [{
                "pubkey": format!("0x{}", "b8".repeat(48)),
                "signed_blocks": [
                    { "slot": "81952", "signing_root": format!("0x{}", "45".repeat(32)) },
                    { "slot": "81951" },
                ],
                "signed_attestations": [
                    { "source_epoch": "2290", "target_epoch": "3007", "signing_root": null },
                ],
            }],
        }))
        .unwrap();

        assert_eq!(document.metadata.interchange_format, None);
        assert_eq!(document.metadata.genesis_validators_root, Root([4; 32]));
        let validator = &document.data[0];
        assert_eq!(validator.pubkey, PublicKey([0xb8; 48]));
        assert_eq!(
            SignedBlock::from(&validator.signed_blocks[0]),
            SignedBlock {
                slot: 81952,
                signing_root: Some(Root([0x45; 32])),
            }
        );
        assert_eq!(validator.signed_blocks[1].signing_root, None);
        assert_eq!(
            SignedAttestation::from(&validator.signed_attestations[0]),
            SignedAttestation {
                source_epoch: 2290,
                target_epoch: 3007,
                signing_root: None,
            }
        );
    }

    #[test]
    fn accepts_legacy_metadata_key() {
        let metadata = serde_json::from_value::<Metadata>(json!({
            "interchange_format": "minimal",
            "interchange_version": "5",
            "genesis_validators_root": format!("0x{}", "00".repeat(32)),
        }))
        .unwrap();
        assert_eq!(metadata.interchange_format, Some(Format::Minimal));
        assert!(check_version(&metadata).is_ok());
    }

    #[test]
    fn rejects_malformed_records() {
        for record in [
            json!({ "slot": 42 }),
            json!({ "slot": "0x2a" }),
            json!({ "slot": "-1" }),
            json!({ "slot": "1", "signing_root": "0x1234" }),
        ] {
            assert!(serde_json::from_value::<BlockRecord>(record).is_err());
        }
    }

    #[test]
    fn omits_missing_roots() {
        assert_eq!(
            serde_json::to_value(BlockRecord {
                slot: Str(1),
                signing_root: None,
            })
            .unwrap(),
            json!({ "slot": "1" }),
        );
        assert_eq!(
            serde_json::to_value(ImportConflict {
                pubkey: PublicKey([1; 48]),
                record: ConflictRecord::Attestation(AttestationRecord {
                    source_epoch: Str(3),
                    target_epoch: Str(2),
                    signing_root: None,
                }),
                reason: Violation::InvalidRange.reason(),
            })
            .unwrap(),
            json!({
                "pubkey": format!("0x{}", "01".repeat(48)),
                "source_epoch": "3",
                "target_epoch": "2",
                "reason": "invalid range",
            }),
        );
    }
}
