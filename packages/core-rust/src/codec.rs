//! Record codec: `MsgPack` encoding of player records and stored rows.
//!
//! Every binary backend (SQL, redb, `MongoDB`, Redis, handoff payloads) stores
//! the output of [`RecordCodec::encode`]. Field names are kept in the
//! encoding so payloads written by older builds remain decodable.

use thiserror::Error;

use crate::record::{PlayerRecord, StoredRow};

/// Failure to encode or decode a persisted record.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The record could not be serialized.
    #[error("failed to encode record: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// The stored bytes are corrupt or were written by an incompatible build.
    #[error("failed to decode record: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Stateless `MsgPack` codec for [`PlayerRecord`] and [`StoredRow`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordCodec;

impl RecordCodec {
    /// Encodes a record into an opaque blob.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn encode(record: &PlayerRecord) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(record)?)
    }

    /// Decodes a blob produced by [`RecordCodec::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] for corrupt or incompatible input.
    pub fn decode(bytes: &[u8]) -> Result<PlayerRecord, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Encodes a full stored row (lock stamp plus encoded record).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn encode_row(row: &StoredRow) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(row)?)
    }

    /// Decodes a stored row.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] for corrupt or incompatible input.
    pub fn decode_row(bytes: &[u8]) -> Result<StoredRow, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Builds a row for `record` with the given lock stamp and write time.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the record cannot be serialized.
    pub fn row_for(
        record: &PlayerRecord,
        lock: i64,
        written_at: i64,
    ) -> Result<StoredRow, CodecError> {
        Ok(StoredRow {
            lock,
            written_at,
            data: Self::encode(record)?,
        })
    }
}
