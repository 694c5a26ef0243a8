//! Parameterized queries over the slashing protection schema.
//!
//! Every function takes a `&Connection` so that it can run inside whichever
//! transaction the caller has open; none of them commit.

use super::Error;
use crate::types::{PublicKey, Root};
use rusqlite::{
    params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
    Connection, OptionalExtension as _, Row, ToSql,
};

/// The database id of a registered validator.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ValidatorId(pub i64);

impl ToSql for ValidatorId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for ValidatorId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Self)
    }
}

impl ToSql for PublicKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_bytes()))
    }
}

impl FromSql for PublicKey {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let bytes = value.as_blob()?;
        Self::from_slice(bytes).ok_or(FromSqlError::InvalidBlobSize {
            expected_size: Self::LEN,
            blob_size: bytes.len(),
        })
    }
}

impl ToSql for Root {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_bytes()))
    }
}

impl FromSql for Root {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let bytes = value.as_blob()?;
        Self::from_slice(bytes).ok_or(FromSqlError::InvalidBlobSize {
            expected_size: Self::LEN,
            blob_size: bytes.len(),
        })
    }
}

/// A block proposal recorded for a validator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SignedBlock {
    pub slot: u64,
    pub signing_root: Option<Root>,
}

/// An attestation recorded for a validator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SignedAttestation {
    pub source_epoch: u64,
    pub target_epoch: u64,
    pub signing_root: Option<Root>,
}

/// The floor below which a validator may never sign again.
///
/// Absent fields place no constraint, and compare lower than any present
/// value when watermarks are merged.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LowWatermark {
    pub slot: Option<u64>,
    pub source_epoch: Option<u64>,
    pub target_epoch: Option<u64>,
}

impl LowWatermark {
    /// Merges two watermarks, keeping the larger value of each field.
    pub fn merge(self, incoming: Self) -> Self {
        Self {
            slot: choose_larger(self.slot, incoming.slot),
            source_epoch: choose_larger(self.source_epoch, incoming.source_epoch),
            target_epoch: choose_larger(self.target_epoch, incoming.target_epoch),
        }
    }
}

/// Picks the larger of two optional values, where `None` is smaller than
/// every present value.
pub fn choose_larger<T>(existing: Option<T>, incoming: Option<T>) -> Option<T>
where
    T: Ord,
{
    existing.max(incoming)
}

/// Converts a slot or epoch to the signed integer SQLite stores.
pub fn sql_int(value: u64) -> Result<i64, Error> {
    i64::try_from(value).map_err(|_| Error::ValueOutOfRange(value))
}

fn sql_opt_int(value: Option<u64>) -> Result<Option<i64>, Error> {
    value.map(sql_int).transpose()
}

fn column_u64(row: &Row, index: usize) -> rusqlite::Result<u64> {
    let value = row.get::<_, i64>(index)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(index, value))
}

fn column_opt_u64(row: &Row, index: usize) -> rusqlite::Result<Option<u64>> {
    match row.get::<_, Option<i64>>(index)? {
        Some(value) => u64::try_from(value)
            .map(Some)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(index, value)),
        None => Ok(None),
    }
}

fn block_from_row(row: &Row) -> rusqlite::Result<SignedBlock> {
    Ok(SignedBlock {
        slot: column_u64(row, 0)?,
        signing_root: row.get(1)?,
    })
}

fn attestation_from_row(row: &Row) -> rusqlite::Result<SignedAttestation> {
    Ok(SignedAttestation {
        source_epoch: column_u64(row, 0)?,
        target_epoch: column_u64(row, 1)?,
        signing_root: row.get(2)?,
    })
}

// Validators

pub fn find_validator(
    conn: &Connection,
    public_key: &PublicKey,
) -> Result<Option<ValidatorId>, Error> {
    Ok(conn
        .query_row(
            "SELECT id FROM validators WHERE public_key = ?1",
            params![public_key],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn insert_validator(conn: &Connection, public_key: &PublicKey) -> Result<ValidatorId, Error> {
    conn.execute(
        "INSERT INTO validators (public_key) VALUES (?1)",
        params![public_key],
    )?;
    Ok(ValidatorId(conn.last_insert_rowid()))
}

pub fn find_validators(conn: &Connection) -> Result<Vec<(ValidatorId, PublicKey)>, Error> {
    let mut stmt = conn.prepare_cached("SELECT id, public_key FROM validators ORDER BY id")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// Blocks

pub fn find_block(
    conn: &Connection,
    id: ValidatorId,
    slot: u64,
) -> Result<Option<SignedBlock>, Error> {
    Ok(conn
        .query_row(
            "SELECT slot, signing_root FROM signed_blocks
             WHERE validator_id = ?1 AND slot = ?2",
            params![id, sql_int(slot)?],
            block_from_row,
        )
        .optional()?)
}

pub fn insert_block(conn: &Connection, id: ValidatorId, block: &SignedBlock) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO signed_blocks (validator_id, slot, signing_root) VALUES (?1, ?2, ?3)",
        params![id, sql_int(block.slot)?, block.signing_root],
    )?;
    Ok(())
}

pub fn find_max_block_slot(conn: &Connection, id: ValidatorId) -> Result<Option<u64>, Error> {
    Ok(conn.query_row(
        "SELECT MAX(slot) FROM signed_blocks WHERE validator_id = ?1",
        params![id],
        |row| column_opt_u64(row, 0),
    )?)
}

pub fn find_blocks(conn: &Connection, id: ValidatorId) -> Result<Vec<SignedBlock>, Error> {
    let mut stmt = conn.prepare_cached(
        "SELECT slot, signing_root FROM signed_blocks WHERE validator_id = ?1 ORDER BY slot",
    )?;
    let rows = stmt.query_map(params![id], block_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn delete_blocks_below(conn: &Connection, id: ValidatorId, slot: u64) -> Result<usize, Error> {
    Ok(conn.execute(
        "DELETE FROM signed_blocks WHERE validator_id = ?1 AND slot < ?2",
        params![id, sql_int(slot)?],
    )?)
}

// Attestations

pub fn find_attestation(
    conn: &Connection,
    id: ValidatorId,
    target_epoch: u64,
) -> Result<Option<SignedAttestation>, Error> {
    Ok(conn
        .query_row(
            "SELECT source_epoch, target_epoch, signing_root FROM signed_attestations
             WHERE validator_id = ?1 AND target_epoch = ?2",
            params![id, sql_int(target_epoch)?],
            attestation_from_row,
        )
        .optional()?)
}

/// Finds a recorded attestation that strictly surrounds `(source, target)`.
pub fn find_surrounding(
    conn: &Connection,
    id: ValidatorId,
    source_epoch: u64,
    target_epoch: u64,
) -> Result<Option<SignedAttestation>, Error> {
    Ok(conn
        .query_row(
            "SELECT source_epoch, target_epoch, signing_root FROM signed_attestations
             WHERE validator_id = ?1 AND source_epoch < ?2 AND target_epoch > ?3
             LIMIT 1",
            params![id, sql_int(source_epoch)?, sql_int(target_epoch)?],
            attestation_from_row,
        )
        .optional()?)
}

/// Finds a recorded attestation strictly surrounded by `(source, target)`.
pub fn find_surrounded(
    conn: &Connection,
    id: ValidatorId,
    source_epoch: u64,
    target_epoch: u64,
) -> Result<Option<SignedAttestation>, Error> {
    Ok(conn
        .query_row(
            "SELECT source_epoch, target_epoch, signing_root FROM signed_attestations
             WHERE validator_id = ?1 AND source_epoch > ?2 AND target_epoch < ?3
             LIMIT 1",
            params![id, sql_int(source_epoch)?, sql_int(target_epoch)?],
            attestation_from_row,
        )
        .optional()?)
}

pub fn insert_attestation(
    conn: &Connection,
    id: ValidatorId,
    attestation: &SignedAttestation,
) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO signed_attestations (validator_id, source_epoch, target_epoch, signing_root)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            id,
            sql_int(attestation.source_epoch)?,
            sql_int(attestation.target_epoch)?,
            attestation.signing_root,
        ],
    )?;
    Ok(())
}

pub fn find_max_target_epoch(conn: &Connection, id: ValidatorId) -> Result<Option<u64>, Error> {
    Ok(conn.query_row(
        "SELECT MAX(target_epoch) FROM signed_attestations WHERE validator_id = ?1",
        params![id],
        |row| column_opt_u64(row, 0),
    )?)
}

/// Finds the attestation with the lowest target epoch at or above `target_epoch`.
pub fn find_nearest_attestation_from(
    conn: &Connection,
    id: ValidatorId,
    target_epoch: u64,
) -> Result<Option<SignedAttestation>, Error> {
    Ok(conn
        .query_row(
            "SELECT source_epoch, target_epoch, signing_root FROM signed_attestations
             WHERE validator_id = ?1 AND target_epoch >= ?2
             ORDER BY target_epoch ASC LIMIT 1",
            params![id, sql_int(target_epoch)?],
            attestation_from_row,
        )
        .optional()?)
}

pub fn find_attestations(
    conn: &Connection,
    id: ValidatorId,
) -> Result<Vec<SignedAttestation>, Error> {
    let mut stmt = conn.prepare_cached(
        "SELECT source_epoch, target_epoch, signing_root FROM signed_attestations
         WHERE validator_id = ?1 ORDER BY target_epoch",
    )?;
    let rows = stmt.query_map(params![id], attestation_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn delete_attestations_below(
    conn: &Connection,
    id: ValidatorId,
    target_epoch: u64,
) -> Result<usize, Error> {
    Ok(conn.execute(
        "DELETE FROM signed_attestations WHERE validator_id = ?1 AND target_epoch < ?2",
        params![id, sql_int(target_epoch)?],
    )?)
}

// Watermarks

pub fn find_watermark(conn: &Connection, id: ValidatorId) -> Result<LowWatermark, Error> {
    let watermark = conn
        .query_row(
            "SELECT slot, source_epoch, target_epoch FROM low_watermarks WHERE validator_id = ?1",
            params![id],
            |row| {
                Ok(LowWatermark {
                    slot: column_opt_u64(row, 0)?,
                    source_epoch: column_opt_u64(row, 1)?,
                    target_epoch: column_opt_u64(row, 2)?,
                })
            },
        )
        .optional()?;
    Ok(watermark.unwrap_or_default())
}

/// Writes a validator's watermark. Callers are responsible for merging with
/// the stored value first so that it never decreases.
pub fn upsert_watermark(
    conn: &Connection,
    id: ValidatorId,
    watermark: &LowWatermark,
) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO low_watermarks (validator_id, slot, source_epoch, target_epoch)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (validator_id) DO UPDATE SET
             slot = excluded.slot,
             source_epoch = excluded.source_epoch,
             target_epoch = excluded.target_epoch",
        params![
            id,
            sql_opt_int(watermark.slot)?,
            sql_opt_int(watermark.source_epoch)?,
            sql_opt_int(watermark.target_epoch)?,
        ],
    )?;
    Ok(())
}

// Metadata

pub fn find_genesis_root(conn: &Connection) -> Result<Option<Root>, Error> {
    Ok(conn
        .query_row(
            "SELECT genesis_validators_root FROM metadata WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn insert_genesis_root(conn: &Connection, root: &Root) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO metadata (id, genesis_validators_root) VALUES (1, ?1)",
        params![root],
    )?;
    Ok(())
}
