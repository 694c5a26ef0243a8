//! Mapping between validator public keys and database ids.

use super::{
    dao::{self, ValidatorId},
    database::Database,
    Error,
};
use crate::types::PublicKey;
use parking_lot::RwLock;
use rusqlite::Connection;
use std::collections::HashMap;

/// Cache of registered validators.
///
/// Entries are only added once the transaction that created or read the row
/// has committed.
#[derive(Default)]
pub struct ValidatorRegistry {
    ids: RwLock<HashMap<PublicKey, ValidatorId>>,
}

impl ValidatorRegistry {
    /// Looks up a validator id, registering the public key within the
    /// caller's transaction if it is unseen.
    ///
    /// A concurrent registration of the same key fails this transaction with
    /// a unique constraint violation, and the retry finds the winner's row.
    pub fn resolve(&self, conn: &Connection, public_key: &PublicKey) -> Result<ValidatorId, Error> {
        if let Some(id) = self.validator_id(public_key) {
            return Ok(id);
        }
        match dao::find_validator(conn, public_key)? {
            Some(id) => Ok(id),
            None => {
                let id = dao::insert_validator(conn, public_key)?;
                tracing::debug!(%public_key, validator_id = id.0, "registered validator");
                Ok(id)
            }
        }
    }

    /// Caches a committed validator row.
    pub fn remember(&self, public_key: PublicKey, id: ValidatorId) {
        self.ids.write().insert(public_key, id);
    }

    /// Registers public keys in batches, one transaction per batch.
    pub fn register(
        &self,
        db: &Database,
        public_keys: &[PublicKey],
        batch_size: usize,
    ) -> Result<(), Error> {
        for batch in public_keys.chunks(batch_size.max(1)) {
            let registered = db.transaction(|tx| {
                batch
                    .iter()
                    .map(|public_key| Ok((*public_key, self.resolve(tx, public_key)?)))
                    .collect::<Result<Vec<_>, Error>>()
            })?;
            for (public_key, id) in registered {
                self.remember(public_key, id);
            }
        }
        tracing::info!(count = public_keys.len(), "registered validators");
        Ok(())
    }

    pub fn validator_id(&self, public_key: &PublicKey) -> Option<ValidatorId> {
        self.ids.read().get(public_key).copied()
    }

    /// Returns the ids of all cached validators.
    pub fn validator_ids(&self) -> Vec<ValidatorId> {
        let mut ids = self.ids.read().values().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}
