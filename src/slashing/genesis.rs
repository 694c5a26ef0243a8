//! Binds a protection database to a single network.

use super::{dao, database::Database, Error};
use crate::types::Root;
use parking_lot::Mutex;

/// Ensures that only one genesis validators root is ever used with a
/// database.
#[derive(Default)]
pub struct GenesisRootGuard {
    stored: Mutex<Option<Root>>,
}

impl GenesisRootGuard {
    /// Returns true if `root` is the database's genesis validators root,
    /// recording it when the database has none yet.
    ///
    /// The stored root is cached after the first successful read; failed
    /// reads leave the cache empty so the next call tries again.
    pub fn confirm(&self, db: &Database, root: &Root) -> Result<bool, Error> {
        let mut stored = self.stored.lock();
        if let Some(stored) = *stored {
            return Ok(stored == *root);
        }

        let existing = db.transaction(|tx| match dao::find_genesis_root(tx)? {
            Some(existing) => Ok(existing),
            None => {
                dao::insert_genesis_root(tx, root)?;
                tracing::info!(genesis_validators_root = %root, "recorded genesis validators root");
                Ok(*root)
            }
        })?;
        *stored = Some(existing);

        if existing != *root {
            tracing::error!(
                expected = %existing,
                requested = %root,
                "genesis validators root mismatch"
            );
        }
        Ok(existing == *root)
    }
}
