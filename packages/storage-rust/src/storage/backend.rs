//! Pluggable persistence backend contract.
//!
//! Defines [`StorageBackend`], the single capability interface every medium
//! implements (file, relational, document, key-value, memory). The
//! [`StorageManager`](crate::manager::StorageManager) depends only on this
//! trait and holds the active backend as `Arc<dyn StorageBackend>`.

use std::collections::HashSet;

use async_trait::async_trait;
use skyhold_core::{FetchOutcome, IslandId, PlayerId, PlayerRecord};

use crate::config::BackendKind;
use crate::error::StorageResult;

/// Durable storage for player records with an embedded advisory lock.
///
/// Every operation is a suspension point and reports failures per call.
/// Implementations never retry connectivity failures internally; retry
/// policy belongs to the manager.
///
/// Lock semantics (shared by all durable implementations):
/// - `fetch(id, true)` returns [`FetchOutcome::Locked`] if another holder's
///   stamp is nonzero and within the TTL, otherwise takes the lock by
///   stamping `now` and returns [`FetchOutcome::Available`].
/// - `store(.., unlock)` persists stamp `0` when `unlock`, else `now`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Which medium this backend persists to.
    fn kind(&self) -> BackendKind;

    /// Establishes the medium (pool, directories, client, schema).
    ///
    /// Called once. On error the backend stays not ready and every operation
    /// returns [`StorageError::NotReady`](crate::error::StorageError::NotReady).
    async fn initialize(&self) -> anyhow::Result<()>;

    /// Whether [`initialize`](Self::initialize) succeeded and the backend is not closed.
    fn is_ready(&self) -> bool;

    /// Loads a record, optionally acquiring its lock.
    async fn fetch(&self, id: PlayerId, lock: bool) -> StorageResult<FetchOutcome>;

    /// Writes a record. Idempotent for identical payloads.
    async fn store(&self, record: &PlayerRecord, unlock: bool) -> StorageResult<()>;

    /// Writes a batch of records.
    ///
    /// Transactional backends are all-or-nothing; the rest write item by item
    /// and report the first failure.
    async fn store_many(&self, records: &[PlayerRecord], unlock: bool) -> StorageResult<()>;

    /// Updates only the lock stamp of an existing record.
    async fn set_lock(&self, id: PlayerId, lock: bool) -> StorageResult<()>;

    /// Full scan of stored identifiers. Maintenance only, may be slow.
    async fn enumerate_ids(&self) -> StorageResult<HashSet<PlayerId>>;

    /// Resolves the owner of an island through the secondary index.
    async fn find_by_island(&self, island_id: IslandId) -> StorageResult<Option<PlayerId>>;

    /// Drops any cached lookup state for a player.
    fn invalidate(&self, _id: PlayerId) {}

    /// Drops any cached lookup state for an island.
    fn invalidate_island(&self, _island_id: IslandId) {}

    /// Releases pools and handles. The backend is not ready afterwards.
    async fn close(&self) -> anyhow::Result<()>;
}
