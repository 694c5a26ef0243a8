//! Slashing protection for validator signing keys.
//!
//! Every block and attestation signing request is checked against the
//! validator's signing history before a signature is produced. The check
//! and the record of the new request commit in one database transaction,
//! so that a signature is only ever produced after its record is durable.

mod attestation;
mod block;
pub mod dao;
mod database;
mod decision;
mod error;
mod genesis;
pub mod interchange;
pub mod pruner;
mod registry;

pub use self::{
    decision::{Decision, Violation},
    error::Error,
    interchange::{ExportOptions, Format, ImportReport, Interchange},
    pruner::{PruneReport, PruningPolicy, PruningSchedule},
};
use self::{
    dao::ValidatorId, database::Database, genesis::GenesisRootGuard,
    registry::ValidatorRegistry,
};
use crate::types::{PublicKey, Root};
use rocket::serde::{json::serde_json, Deserialize};
use rusqlite::Transaction;
use std::{io::Read, path::PathBuf, time::Duration};

/// Slashing protection configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(crate = "rocket::serde", default)]
pub struct SlashingProtectionConfig {
    /// Whether block and attestation requests are checked at all.
    pub enabled: bool,
    /// The SQLite database file.
    pub db_path: PathBuf,
    pub pool_size: usize,
    pub busy_timeout_ms: u64,
    /// Additional attempts for transactions that fail transiently.
    pub max_retries: usize,
    pub retry_backoff_ms: u64,
    /// Number of validators registered per transaction at start-up.
    pub registration_batch_size: usize,
    /// How long the health check waits for the database.
    pub health_check_timeout_ms: u64,
    pub pruning: PruningConfig,
}

impl Default for SlashingProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: PathBuf::from("slashing-protection.sqlite"),
            pool_size: 4,
            busy_timeout_ms: 5000,
            max_retries: 3,
            retry_backoff_ms: 10,
            registration_batch_size: 500,
            health_check_timeout_ms: 3000,
            pruning: PruningConfig::default(),
        }
    }
}

/// Background pruning configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(crate = "rocket::serde", default)]
pub struct PruningConfig {
    pub enabled: bool,
    /// Whether the first run happens at start-up rather than after one
    /// interval.
    pub at_boot: bool,
    pub epochs_to_keep: u64,
    pub slots_per_epoch: u64,
    pub interval_secs: u64,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            at_boot: true,
            epochs_to_keep: 250,
            slots_per_epoch: 32,
            interval_secs: 12 * 60 * 60,
        }
    }
}

impl PruningConfig {
    pub fn schedule(&self) -> Result<PruningSchedule, Error> {
        Ok(PruningSchedule {
            policy: PruningPolicy::new(self.epochs_to_keep, self.slots_per_epoch)?,
            period: Duration::from_secs(self.interval_secs.max(1)),
            at_boot: self.at_boot,
        })
    }
}

/// The slashing protection database and its in-memory caches.
pub struct SlashingProtection {
    db: Database,
    registry: ValidatorRegistry,
    genesis: GenesisRootGuard,
    registration_batch_size: usize,
    health_check_timeout: Duration,
}

impl SlashingProtection {
    /// Opens the configured database, creating it if needed.
    pub fn open(config: &SlashingProtectionConfig) -> Result<Self, Error> {
        Ok(Self {
            db: Database::open(&config.db_path, config)?,
            registry: ValidatorRegistry::default(),
            genesis: GenesisRootGuard::default(),
            registration_batch_size: config.registration_batch_size,
            health_check_timeout: Duration::from_millis(config.health_check_timeout_ms),
        })
    }

    /// Confirms the database answers queries.
    pub fn check_health(&self) -> Result<(), Error> {
        self.db.check_health()
    }

    pub fn health_check_timeout(&self) -> Duration {
        self.health_check_timeout
    }

    /// Registers the validators whose keys were loaded at start-up.
    pub fn register_validators(&self, public_keys: &[PublicKey]) -> Result<(), Error> {
        self.registry
            .register(&self.db, public_keys, self.registration_batch_size)
    }

    /// The number of validators registered by this process.
    pub fn registered_validators(&self) -> usize {
        self.registry.validator_ids().len()
    }

    /// Returns true if `root` is the genesis validators root of this
    /// database, recording it on first use.
    pub fn confirm_genesis_root(&self, root: &Root) -> Result<bool, Error> {
        self.genesis.confirm(&self.db, root)
    }

    /// Checks and records a block signing request.
    pub fn may_sign_block(
        &self,
        public_key: &PublicKey,
        signing_root: Root,
        slot: u64,
        genesis_validators_root: &Root,
    ) -> Result<Decision, Error> {
        self.ensure_genesis_root(genesis_validators_root)?;
        let decision =
            self.with_validator(public_key, |tx, id| block::may_block(tx, id, slot, signing_root))?;
        if let Decision::Deny(violation) = decision {
            tracing::warn!(
                %public_key,
                slot,
                %signing_root,
                reason = violation.reason(),
                "refused to sign block"
            );
        }
        Ok(decision)
    }

    /// Checks and records an attestation signing request.
    pub fn may_sign_attestation(
        &self,
        public_key: &PublicKey,
        signing_root: Root,
        source_epoch: u64,
        target_epoch: u64,
        genesis_validators_root: &Root,
    ) -> Result<Decision, Error> {
        self.ensure_genesis_root(genesis_validators_root)?;
        let decision = self.with_validator(public_key, |tx, id| {
            attestation::may_vote(tx, id, source_epoch, target_epoch, signing_root)
        })?;
        if let Decision::Deny(violation) = decision {
            tracing::warn!(
                %public_key,
                source_epoch,
                target_epoch,
                %signing_root,
                reason = violation.reason(),
                "refused to sign attestation"
            );
        }
        Ok(decision)
    }

    /// Imports an interchange document.
    ///
    /// Each validator is imported in its own transaction. Conflicting
    /// records are reported rather than failing the import. Documents that
    /// cannot be stored at all are rejected before anything is written.
    pub fn import(&self, interchange: &Interchange) -> Result<ImportReport, Error> {
        interchange::check_version(&interchange.metadata)?;
        interchange::check_ranges(interchange)?;
        self.ensure_genesis_root(&interchange.metadata.genesis_validators_root)?;

        let mut report = ImportReport::default();
        for data in &interchange.data {
            let imported = self.with_validator(&data.pubkey, |tx, id| {
                interchange::import_validator(tx, id, data)
            })?;
            tracing::info!(
                pubkey = %data.pubkey,
                accepted = imported.accepted,
                duplicates = imported.duplicates,
                rejected = imported.rejected,
                "imported slashing protection history"
            );
            report.validators += imported.validators;
            report.accepted += imported.accepted;
            report.duplicates += imported.duplicates;
            report.rejected += imported.rejected;
            report.conflicts.extend(imported.conflicts);
        }
        Ok(report)
    }

    /// Reads and imports an interchange document.
    pub fn import_from(&self, reader: impl Read) -> Result<ImportReport, Error> {
        let interchange = serde_json::from_reader::<_, Interchange>(reader)?;
        self.import(&interchange)
    }

    /// Exports the database as an interchange document.
    pub fn export(&self, options: &ExportOptions) -> Result<Interchange, Error> {
        self.db.read_transaction(|tx| {
            let genesis_validators_root =
                dao::find_genesis_root(tx)?.ok_or(Error::MissingGenesisRoot)?;
            let validators = match &options.public_keys {
                Some(public_keys) => {
                    let mut validators = Vec::with_capacity(public_keys.len());
                    for public_key in public_keys {
                        if let Some(id) = dao::find_validator(tx, public_key)? {
                            validators.push((id, *public_key));
                        }
                    }
                    validators
                }
                None => dao::find_validators(tx)?,
            };

            let mut data = Vec::with_capacity(validators.len());
            for (id, public_key) in validators {
                if let Some(validator) =
                    interchange::export_validator(tx, id, public_key, options.format)?
                {
                    data.push(validator);
                }
            }

            Ok(Interchange {
                metadata: interchange::Metadata {
                    interchange_format: Some(options.format),
                    interchange_format_version: interchange::INTERCHANGE_VERSION.to_owned(),
                    genesis_validators_root,
                },
                data,
            })
        })
    }

    /// Prunes every validator in the database, each in its own transaction.
    ///
    /// A failure for one validator is logged and counted, and the others are
    /// still pruned.
    pub fn prune(&self, policy: &PruningPolicy) -> Result<PruneReport, Error> {
        let validators = self.db.read_transaction(|tx| dao::find_validators(tx))?;

        let mut report = PruneReport::default();
        for (id, public_key) in validators {
            match self
                .db
                .transaction(|tx| pruner::prune_validator(tx, id, policy))
            {
                Ok(pruned) => report.add(pruned),
                Err(err) => {
                    tracing::warn!(%public_key, ?err, "failed to prune validator");
                    report.failures += 1;
                }
            }
        }
        Ok(report)
    }

    fn ensure_genesis_root(&self, root: &Root) -> Result<(), Error> {
        if !self.confirm_genesis_root(root)? {
            return Err(Error::GenesisRootMismatch(*root));
        }
        Ok(())
    }

    /// Runs `f` for a validator in one transaction, registering the
    /// validator if needed. Its id is cached once the transaction commits.
    fn with_validator<T, F>(&self, public_key: &PublicKey, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&Transaction, ValidatorId) -> Result<T, Error>,
    {
        let (id, value) = self.db.transaction(|tx| {
            let id = self.registry.resolve(tx, public_key)?;
            Ok((id, f(tx, id)?))
        })?;
        self.registry.remember(*public_key, id);
        Ok(value)
    }
}
