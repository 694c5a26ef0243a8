//! Slashing protection errors.

use crate::types::Root;
use rocket::serde::json::serde_json;
use rusqlite::{ffi, ErrorCode};
use thiserror::Error;

/// An error raised by the slashing protection database.
///
/// Refusals to sign are not errors: they are reported as
/// [`super::Decision::Deny`] so that callers can tell a safety refusal apart
/// from a storage failure.
#[derive(Debug, Error)]
pub enum Error {
    /// An error occured in the underlying database.
    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A retryable database error persisted past the retry limit.
    #[error("transaction failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: rusqlite::Error,
    },

    /// A slot or epoch is too large to be stored.
    #[error("value {0} exceeds the storable integer range")]
    ValueOutOfRange(u64),

    /// The database was created by an incompatible schema.
    #[error("database schema version {found} does not match expected version {expected}")]
    SchemaVersion { found: i64, expected: i64 },

    /// The database belongs to a different network.
    #[error("genesis validators root {0} does not match the database")]
    GenesisRootMismatch(Root),

    /// No genesis validators root has been recorded yet.
    #[error("no genesis validators root recorded in the database")]
    MissingGenesisRoot,

    /// The pruning retention policy is invalid.
    #[error("invalid pruning policy: {0}")]
    InvalidPruningPolicy(&'static str),

    /// The interchange document uses an unsupported version.
    #[error("unsupported interchange format version '{0}'")]
    UnsupportedInterchangeVersion(String),

    /// The interchange document could not be parsed.
    #[error("invalid interchange document: {0}")]
    Json(#[from] serde_json::Error),

    /// An error occured reading or writing an interchange document.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Busy and locked databases, and unique constraint violations from a
/// concurrent insert of the same row.
pub(super) fn is_retryable(err: &rusqlite::Error) -> bool {
    let rusqlite::Error::SqliteFailure(err, _) = err else {
        return false;
    };
    match err.code {
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => true,
        ErrorCode::ConstraintViolation => matches!(
            err.extended_code,
            ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn insert_error(conn: &Connection, sql: &str) -> rusqlite::Error {
        conn.execute(sql, []).unwrap_err()
    }

    #[test]
    fn retries_only_transient_failures() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE rows (
                 id INTEGER PRIMARY KEY,
                 key INTEGER NOT NULL UNIQUE CHECK (key >= 0)
             );
             INSERT INTO rows (id, key) VALUES (1, 1);",
        )
        .unwrap();

        assert!(is_retryable(&insert_error(
            &conn,
            "INSERT INTO rows (id, key) VALUES (2, 1)"
        )));
        assert!(is_retryable(&insert_error(
            &conn,
            "INSERT INTO rows (id, key) VALUES (1, 2)"
        )));
        assert!(!is_retryable(&insert_error(
            &conn,
            "INSERT INTO rows (id, key) VALUES (3, -1)"
        )));
        assert!(!is_retryable(&insert_error(
            &conn,
            "INSERT INTO rows (id, key) VALUES (4, NULL)"
        )));
        assert!(is_retryable(&rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_BUSY),
            None
        )));
        assert!(!is_retryable(&rusqlite::Error::QueryReturnedNoRows));
    }
}
