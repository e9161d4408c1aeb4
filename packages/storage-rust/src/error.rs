//! Error taxonomy for storage operations.
//!
//! Lock contention is deliberately absent: it is reported through
//! [`FetchOutcome::Locked`](skyhold_core::FetchOutcome::Locked), not as an error.

use skyhold_core::PlayerId;
use thiserror::Error;

use crate::config::BackendKind;

/// Result alias for backend operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure of a single backend operation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend was never initialized, failed to initialize, or has been closed.
    #[error("{0} backend is not ready")]
    NotReady(BackendKind),

    /// The backend configuration is structurally invalid.
    #[error("invalid {kind} configuration: {reason}")]
    Config {
        /// Backend that rejected the configuration.
        kind: BackendKind,
        /// Human-readable description of the problem.
        reason: String,
    },

    /// Network, pool, disk or driver failure. Never retried inside the backend.
    #[error("{kind} backend I/O failure: {source}")]
    Connectivity {
        /// Backend that failed.
        kind: BackendKind,
        /// Underlying driver error.
        #[source]
        source: anyhow::Error,
    },

    /// A stored record could not be decoded. The caller gets no record.
    #[error("stored record for {id} is unreadable: {source}")]
    Corrupt {
        /// Identifier of the offending record.
        id: PlayerId,
        /// Decoder error.
        #[source]
        source: anyhow::Error,
    },

    /// A record could not be encoded for storage.
    #[error("record for {id} could not be encoded: {source}")]
    Encode {
        /// Identifier of the record.
        id: PlayerId,
        /// Encoder error.
        #[source]
        source: anyhow::Error,
    },

    /// A transactional batch failed and was rolled back as a whole.
    #[error("batch of {count} records rolled back: {source}")]
    BatchRolledBack {
        /// Number of records in the batch.
        count: usize,
        /// First failure inside the transaction.
        #[source]
        source: anyhow::Error,
    },
}

impl StorageError {
    /// Wraps a driver error as a connectivity failure.
    pub fn io(kind: BackendKind, err: impl Into<anyhow::Error>) -> Self {
        StorageError::Connectivity {
            kind,
            source: err.into(),
        }
    }

    /// Wraps a decoder error for the given record.
    pub fn corrupt(id: PlayerId, err: impl Into<anyhow::Error>) -> Self {
        StorageError::Corrupt {
            id,
            source: err.into(),
        }
    }

    /// Wraps an encoder error for the given record.
    pub fn encode(id: PlayerId, err: impl Into<anyhow::Error>) -> Self {
        StorageError::Encode {
            id,
            source: err.into(),
        }
    }

    /// Returns `true` for errors that indicate unreadable stored data.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StorageError::Corrupt { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_backend_kind() {
        let err = StorageError::io(BackendKind::Postgres, anyhow::anyhow!("connection refused"));
        assert_eq!(
            err.to_string(),
            "postgresql backend I/O failure: connection refused"
        );
    }

    #[test]
    fn corrupt_is_flagged() {
        let err = StorageError::corrupt(uuid::Uuid::nil(), anyhow::anyhow!("bad tag"));
        assert!(err.is_corrupt());
        assert!(!StorageError::NotReady(BackendKind::Json).is_corrupt());
    }
}
