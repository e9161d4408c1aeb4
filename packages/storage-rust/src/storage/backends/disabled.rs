//! Placeholder [`StorageBackend`] for kinds whose driver was not compiled in.
//!
//! [`DisabledBackend`] fails `initialize` with a configuration error and
//! rejects every operation with [`StorageError::NotReady`], so the manager
//! refuses activations instead of silently dropping writes.

use std::collections::HashSet;

use async_trait::async_trait;
use skyhold_core::{FetchOutcome, IslandId, PlayerId, PlayerRecord};

use crate::config::BackendKind;
use crate::error::{StorageError, StorageResult};
use crate::storage::backend::StorageBackend;

/// Backend for a kind whose cargo feature is disabled.
pub struct DisabledBackend {
    kind: BackendKind,
}

impl DisabledBackend {
    /// Stands in for `kind`.
    #[must_use]
    pub fn new(kind: BackendKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl StorageBackend for DisabledBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        Err(StorageError::Config {
            kind: self.kind,
            reason: "driver not compiled into this build".to_string(),
        }
        .into())
    }

    fn is_ready(&self) -> bool {
        false
    }

    async fn fetch(&self, _id: PlayerId, _lock: bool) -> StorageResult<FetchOutcome> {
        Err(StorageError::NotReady(self.kind))
    }

    async fn store(&self, _record: &PlayerRecord, _unlock: bool) -> StorageResult<()> {
        Err(StorageError::NotReady(self.kind))
    }

    async fn store_many(&self, _records: &[PlayerRecord], _unlock: bool) -> StorageResult<()> {
        Err(StorageError::NotReady(self.kind))
    }

    async fn set_lock(&self, _id: PlayerId, _lock: bool) -> StorageResult<()> {
        Err(StorageError::NotReady(self.kind))
    }

    async fn enumerate_ids(&self) -> StorageResult<HashSet<PlayerId>> {
        Err(StorageError::NotReady(self.kind))
    }

    async fn find_by_island(&self, _island_id: IslandId) -> StorageResult<Option<PlayerId>> {
        Err(StorageError::NotReady(self.kind))
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
