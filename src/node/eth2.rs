//! Consensus layer signing request types.

use crate::{serialization::Str, types::Root};
use rocket::serde::Deserialize;

/// A request to sign a consensus layer message.
///
/// Only the fields needed for slashing protection are read; the signing
/// root is computed by the caller.
#[derive(Debug, Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct SignRequest {
    #[serde(rename = "type")]
    pub artifact: ArtifactType,
    pub signing_root: Root,
    #[serde(default)]
    pub fork_info: Option<ForkInfo>,
    #[serde(default)]
    pub block: Option<BlockHeader>,
    #[serde(default)]
    pub beacon_block: Option<BeaconBlock>,
    #[serde(default)]
    pub attestation: Option<AttestationData>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(crate = "rocket::serde", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactType {
    Block,
    BlockV2,
    Attestation,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct ForkInfo {
    pub genesis_validators_root: Root,
}

#[derive(Debug, Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct BlockHeader {
    pub slot: Str<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct BeaconBlock {
    pub block_header: BlockHeader,
}

#[derive(Debug, Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct AttestationData {
    pub source: Checkpoint,
    pub target: Checkpoint,
}

#[derive(Debug, Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct Checkpoint {
    pub epoch: Str<u64>,
}

/// The part of a request that slashing protection checks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Slashable {
    Block {
        slot: u64,
        genesis_validators_root: Root,
    },
    Attestation {
        source_epoch: u64,
        target_epoch: u64,
        genesis_validators_root: Root,
    },
    None,
}

impl SignRequest {
    /// Extracts the slashable part of the request.
    pub fn slashable(&self) -> Result<Slashable, &'static str> {
        let genesis_validators_root = || {
            self.fork_info
                .as_ref()
                .map(|fork_info| fork_info.genesis_validators_root)
                .ok_or("missing fork_info")
        };

        match self.artifact {
            ArtifactType::Block | ArtifactType::BlockV2 => {
                let slot = match (&self.block, &self.beacon_block) {
                    (Some(block), _) => *block.slot,
                    (None, Some(beacon_block)) => *beacon_block.block_header.slot,
                    (None, None) => return Err("missing block slot"),
                };
                Ok(Slashable::Block {
                    slot,
                    genesis_validators_root: genesis_validators_root()?,
                })
            }
            ArtifactType::Attestation => {
                let attestation = self.attestation.as_ref().ok_or("missing attestation")?;
                Ok(Slashable::Attestation {
                    source_epoch: *attestation.source.epoch,
                    target_epoch: *attestation.target.epoch,
                    genesis_validators_root: genesis_validators_root()?,
                })
            }
            ArtifactType::Other => Ok(Slashable::None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocket::serde::json::{serde_json, serde_json::json};

    fn fork_info() -> serde_json::Value {
        json!({
            "fork": {
                "previous_version": "0x00000001",
                "current_version": "0x00000001",
                "epoch": "1",
            },
            "genesis_validators_root": format!("0x{}", "04".repeat(32)),
        })
    }

    #[test]
    fn block_requests() {
        let request = serde_json::from_value::<SignRequest>(json!({
            "type": "BLOCK_V2",
            "signing_root": format!("0x{}", "aa".repeat(32)),
            "fork_info": fork_info(),
            "beacon_block": {
                "version": "PHASE0",
                "block_header": { "slot": "100", "proposer_index": "5" },
            },
        }))
        .unwrap();
        assert_eq!(
            request.slashable(),
            Ok(Slashable::Block {
                slot: 100,
                genesis_validators_root: Root([4; 32]),
            })
        );
    }

    #[test]
    fn attestation_requests() {
        let request = serde_json::from_value::<SignRequest>(json!({
            "type": "ATTESTATION",
            "signing_root": format!("0x{}", "aa".repeat(32)),
            "fork_info": fork_info(),
            "attestation": {
                "slot": "32",
                "index": "0",
                "beacon_block_root": format!("0x{}", "00".repeat(32)),
                "source": { "epoch": "1", "root": format!("0x{}", "00".repeat(32)) },
                "target": { "epoch": "2", "root": format!("0x{}", "00".repeat(32)) },
            },
        }))
        .unwrap();
        assert_eq!(
            request.slashable(),
            Ok(Slashable::Attestation {
                source_epoch: 1,
                target_epoch: 2,
                genesis_validators_root: Root([4; 32]),
            })
        );
    }

    #[test]
    fn other_requests_are_not_slashable() {
        let request = serde_json::from_value::<SignRequest>(json!({
            "type": "RANDAO_REVEAL",
            "signing_root": format!("0x{}", "aa".repeat(32)),
        }))
        .unwrap();
        assert_eq!(request.artifact, ArtifactType::Other);
        assert_eq!(request.slashable(), Ok(Slashable::None));
    }

    #[test]
    fn incomplete_requests() {
        let request = serde_json::from_value::<SignRequest>(json!({
            "type": "BLOCK",
            "signing_root": format!("0x{}", "aa".repeat(32)),
            "block": { "slot": "1" },
        }))
        .unwrap();
        assert_eq!(request.slashable(), Err("missing fork_info"));
    }
}
