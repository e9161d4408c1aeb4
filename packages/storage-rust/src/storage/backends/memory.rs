//! Ephemeral [`StorageBackend`] backed by [`DashMap`].
//!
//! Selected by `backend = "none"`. Honors the full lock protocol so a
//! single-process deployment behaves exactly like a durable one, but nothing
//! survives a restart.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use skyhold_core::{Clock, FetchOutcome, IslandId, LockPolicy, PlayerId, PlayerRecord};

use crate::config::BackendKind;
use crate::error::{StorageError, StorageResult};
use crate::storage::backend::StorageBackend;

struct MemoryEntry {
    lock: i64,
    record: PlayerRecord,
}

/// In-memory storage for player records.
pub struct MemoryBackend {
    entries: DashMap<PlayerId, MemoryEntry>,
    islands: DashMap<IslandId, PlayerId>,
    policy: LockPolicy,
    clock: Arc<dyn Clock>,
    ready: AtomicBool,
}

impl MemoryBackend {
    /// Creates an empty backend. It becomes ready on [`initialize`](StorageBackend::initialize).
    #[must_use]
    pub fn new(policy: LockPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            islands: DashMap::new(),
            policy,
            clock,
            ready: AtomicBool::new(false),
        }
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current lock stamp of a record, if present.
    #[must_use]
    pub fn lock_stamp(&self, id: PlayerId) -> Option<i64> {
        self.entries.get(&id).map(|e| e.lock)
    }

    fn ensure_ready(&self) -> StorageResult<()> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::NotReady(BackendKind::Memory))
        }
    }

    fn put(&self, record: &PlayerRecord, unlock: bool, now: i64) {
        let id = record.id();
        let stamp = LockPolicy::stamp_for_store(unlock, now);
        let previous = self.entries.insert(
            id,
            MemoryEntry {
                lock: stamp,
                record: record.clone(),
            },
        );
        if let Some(old_island) = previous.and_then(|e| e.record.island_id) {
            if record.island_id != Some(old_island) {
                self.islands.remove_if(&old_island, |_, owner| *owner == id);
            }
        }
        if let Some(island) = record.island_id {
            self.islands.insert(island, id);
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn fetch(&self, id: PlayerId, lock: bool) -> StorageResult<FetchOutcome> {
        self.ensure_ready()?;
        let now = self.clock.now_secs();
        // get_mut holds the shard write lock, so check-and-stamp is atomic.
        let Some(mut entry) = self.entries.get_mut(&id) else {
            return Ok(FetchOutcome::Absent);
        };
        if !lock {
            return Ok(FetchOutcome::Available(entry.record.clone()));
        }
        if self.policy.is_held(entry.lock, now) {
            return Ok(FetchOutcome::Locked(entry.record.clone()));
        }
        entry.lock = now;
        Ok(FetchOutcome::Available(entry.record.clone()))
    }

    async fn store(&self, record: &PlayerRecord, unlock: bool) -> StorageResult<()> {
        self.ensure_ready()?;
        self.put(record, unlock, self.clock.now_secs());
        Ok(())
    }

    async fn store_many(&self, records: &[PlayerRecord], unlock: bool) -> StorageResult<()> {
        self.ensure_ready()?;
        let now = self.clock.now_secs();
        for record in records {
            self.put(record, unlock, now);
        }
        Ok(())
    }

    async fn set_lock(&self, id: PlayerId, lock: bool) -> StorageResult<()> {
        self.ensure_ready()?;
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.lock = LockPolicy::stamp_for_store(!lock, self.clock.now_secs());
        }
        Ok(())
    }

    async fn enumerate_ids(&self) -> StorageResult<HashSet<PlayerId>> {
        self.ensure_ready()?;
        Ok(self.entries.iter().map(|e| *e.key()).collect())
    }

    async fn find_by_island(&self, island_id: IslandId) -> StorageResult<Option<PlayerId>> {
        self.ensure_ready()?;
        Ok(self.islands.get(&island_id).map(|e| *e.value()))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.ready.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use skyhold_core::ManualClock;
    use uuid::Uuid;

    use super::*;

    async fn backend(clock: Arc<ManualClock>) -> MemoryBackend {
        let backend = MemoryBackend::new(LockPolicy::default(), clock);
        backend.initialize().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn not_ready_before_initialize() {
        let backend = MemoryBackend::new(LockPolicy::default(), Arc::new(ManualClock::new(0)));
        let err = backend.fetch(Uuid::new_v4(), false).await.unwrap_err();
        assert!(matches!(err, StorageError::NotReady(BackendKind::Memory)));
    }

    #[tokio::test]
    async fn store_then_fetch() {
        let clock = Arc::new(ManualClock::new(1_000));
        let backend = backend(clock).await;
        let record = PlayerRecord::new(Uuid::new_v4(), "alex").with_island(3);

        assert!(backend.fetch(record.id(), true).await.unwrap().is_absent());
        backend.store(&record, true).await.unwrap();

        let fetched = backend.fetch(record.id(), true).await.unwrap();
        assert_eq!(fetched.into_available(), Some(record.clone()));
        assert_eq!(backend.lock_stamp(record.id()), Some(1_000));
        assert_eq!(backend.find_by_island(3).await.unwrap(), Some(record.id()));
    }

    #[tokio::test]
    async fn held_lock_reports_locked_until_stale() {
        let clock = Arc::new(ManualClock::new(1_000));
        let backend = backend(clock.clone()).await;
        let record = PlayerRecord::new(Uuid::new_v4(), "steve");
        backend.store(&record, false).await.unwrap();

        clock.advance(5);
        assert!(backend.fetch(record.id(), true).await.unwrap().is_locked());

        clock.advance(30);
        let outcome = backend.fetch(record.id(), true).await.unwrap();
        assert!(!outcome.is_locked());
        assert_eq!(backend.lock_stamp(record.id()), Some(1_035));
    }

    #[tokio::test]
    async fn set_lock_releases_without_touching_payload() {
        let clock = Arc::new(ManualClock::new(50));
        let backend = backend(clock).await;
        let mut record = PlayerRecord::new(Uuid::new_v4(), "steve");
        record.set("level", 4);
        backend.store(&record, false).await.unwrap();

        backend.set_lock(record.id(), false).await.unwrap();
        assert_eq!(backend.lock_stamp(record.id()), Some(0));
        let fetched = backend.fetch(record.id(), false).await.unwrap();
        assert_eq!(fetched.record(), Some(&record));
    }

    #[tokio::test]
    async fn moving_island_updates_index() {
        let clock = Arc::new(ManualClock::new(50));
        let backend = backend(clock).await;
        let mut record = PlayerRecord::new(Uuid::new_v4(), "steve").with_island(1);
        backend.store(&record, true).await.unwrap();
        record.island_id = Some(2);
        backend.store_many(&[record.clone()], true).await.unwrap();

        assert_eq!(backend.find_by_island(1).await.unwrap(), None);
        assert_eq!(backend.find_by_island(2).await.unwrap(), Some(record.id()));
        assert_eq!(
            backend.enumerate_ids().await.unwrap(),
            HashSet::from([record.id()])
        );
    }

    #[tokio::test]
    async fn close_makes_backend_not_ready() {
        let backend = backend(Arc::new(ManualClock::new(0))).await;
        backend.close().await.unwrap();
        assert!(!backend.is_ready());
        assert!(backend.enumerate_ids().await.is_err());
    }
}
