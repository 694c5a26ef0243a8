//! SQLite connection pool and transaction discipline.

use super::{error::is_retryable, Error, SlashingProtectionConfig};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::{
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// The schema version this build reads and writes.
pub const SCHEMA_VERSION: i64 = 1;

/// The slashing protection database.
///
/// Holds a fixed set of connections handed out round-robin. Every unit of
/// work runs in an `IMMEDIATE` transaction, which takes the database write
/// lock up front so that a check and the insert it guards are never
/// interleaved with another writer.
pub struct Database {
    connections: Vec<Mutex<Connection>>,
    next: AtomicUsize,
    retryer: TransactionRetryer,
}

impl Database {
    /// Opens or creates the database at the specified path.
    pub fn open(path: &Path, config: &SlashingProtectionConfig) -> Result<Self, Error> {
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let connections = (0..config.pool_size.max(1))
            .map(|_| open_connection(path, busy_timeout).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;

        let found = {
            let conn = connections[0].lock();
            conn.execute_batch(SCHEMA_SQL)?;
            conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?
        };
        if found != SCHEMA_VERSION {
            return Err(Error::SchemaVersion {
                found,
                expected: SCHEMA_VERSION,
            });
        }

        tracing::debug!(
            path = %path.display(),
            pool_size = connections.len(),
            "opened slashing protection database"
        );
        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
            retryer: TransactionRetryer::new(
                config.max_retries,
                Duration::from_millis(config.retry_backoff_ms),
            ),
        })
    }

    /// Runs `f` in a transaction and commits its result.
    ///
    /// The closure may run more than once: retryable failures roll the
    /// transaction back and start over, so it must not have side effects
    /// outside of the transaction.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnMut(&Transaction) -> Result<T, Error>,
    {
        self.run(TransactionBehavior::Immediate, f)
    }

    /// Runs `f` in a deferred transaction, which only takes a read lock and
    /// so does not block signers. `f` must not write.
    pub fn read_transaction<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnMut(&Transaction) -> Result<T, Error>,
    {
        self.run(TransactionBehavior::Deferred, f)
    }

    /// Runs a trivial query to confirm the database is usable.
    pub fn check_health(&self) -> Result<(), Error> {
        self.read_transaction(|tx| {
            tx.query_row("SELECT COUNT(*) FROM schema_version", [], |row| {
                row.get::<_, i64>(0)
            })?;
            Ok(())
        })
    }

    fn run<T, F>(&self, behavior: TransactionBehavior, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&Transaction) -> Result<T, Error>,
    {
        self.retryer.run(|| {
            let mut conn = self.connection();
            let tx = conn.transaction_with_behavior(behavior)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[index].lock()
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, Error> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(busy_timeout)?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = FULL;")?;
    Ok(conn)
}

/// Retries transactions that failed for transient reasons.
#[derive(Clone, Copy, Debug)]
pub struct TransactionRetryer {
    max_retries: usize,
    backoff: Duration,
}

impl TransactionRetryer {
    pub fn new(max_retries: usize, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Runs `attempt` until it succeeds, fails with a non-retryable error, or
    /// has been retried `max_retries` times.
    pub fn run<T, F>(&self, mut attempt: F) -> Result<T, Error>
    where
        F: FnMut() -> Result<T, Error>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match attempt() {
                Err(Error::Storage(err)) if is_retryable(&err) => {
                    if attempts > self.max_retries {
                        tracing::warn!(attempts, %err, "transaction retries exhausted");
                        return Err(Error::RetriesExhausted {
                            attempts,
                            source: err,
                        });
                    }
                    tracing::debug!(attempts, %err, "retrying transaction");
                    thread::sleep(self.backoff);
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn busy() -> Error {
        Error::Storage(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_BUSY),
            None,
        ))
    }

    #[test]
    fn retries_transient_failures() {
        let retryer = TransactionRetryer::new(1, Duration::ZERO);
        let mut tries = 0;
        let result = retryer.run(|| {
            tries += 1;
            if tries == 1 {
                Err(busy())
            } else {
                Ok(tries)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn retries_up_to_max_retries() {
        let retryer = TransactionRetryer::new(3, Duration::ZERO);
        let mut tries = 0;
        let result = retryer.run(|| -> Result<(), Error> {
            tries += 1;
            Err(busy())
        });
        assert!(matches!(
            result,
            Err(Error::RetriesExhausted { attempts: 4, .. })
        ));
        assert_eq!(tries, 4);
    }

    #[test]
    fn does_not_retry_permanent_failures() {
        let retryer = TransactionRetryer::new(3, Duration::ZERO);
        let mut tries = 0;
        let result = retryer.run(|| -> Result<(), Error> {
            tries += 1;
            Err(Error::ValueOutOfRange(u64::MAX))
        });
        assert!(matches!(result, Err(Error::ValueOutOfRange(_))));
        assert_eq!(tries, 1);
    }

    #[test]
    fn reads_do_not_hold_the_write_lock() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(
            &dir.path().join("slashing.sqlite"),
            &SlashingProtectionConfig {
                busy_timeout_ms: 0,
                max_retries: 0,
                ..Default::default()
            },
        )
        .unwrap();

        let inserted = db
            .read_transaction(|reader| {
                reader.query_row("SELECT COUNT(*) FROM validators", [], |row| {
                    row.get::<_, i64>(0)
                })?;
                db.transaction(|tx| {
                    Ok(tx.execute("INSERT INTO validators (public_key) VALUES (x'01')", [])?)
                })
            })
            .unwrap();
        assert_eq!(inserted, 1);
        db.check_health().unwrap();
    }

    #[test]
    fn creates_schema_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slashing.sqlite");
        let config = SlashingProtectionConfig::default();

        Database::open(&path, &config).unwrap();
        let db = Database::open(&path, &config).unwrap();
        let version: i64 = db
            .transaction(|tx| {
                Ok(tx.query_row("SELECT COUNT(*) FROM schema_version", [], |row| {
                    row.get(0)
                })?)
            })
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn rejects_unknown_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slashing.sqlite");
        let config = SlashingProtectionConfig::default();

        let db = Database::open(&path, &config).unwrap();
        db.transaction(|tx| Ok(tx.execute("UPDATE schema_version SET version = 7", [])?))
            .unwrap();
        drop(db);

        assert!(matches!(
            Database::open(&path, &config),
            Err(Error::SchemaVersion { found: 7, .. })
        ));
    }

    #[test]
    fn rolls_back_failed_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(
            &dir.path().join("slashing.sqlite"),
            &SlashingProtectionConfig::default(),
        )
        .unwrap();

        let result = db.transaction(|tx| -> Result<(), Error> {
            tx.execute("INSERT INTO validators (public_key) VALUES (x'01')", [])?;
            Err(Error::ValueOutOfRange(u64::MAX))
        });
        assert!(result.is_err());

        let count: i64 = db
            .transaction(|tx| {
                Ok(tx.query_row("SELECT COUNT(*) FROM validators", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
