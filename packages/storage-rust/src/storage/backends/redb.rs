//! Embedded key-value backend on [`redb`].
//!
//! Three tables share one database file `{data_dir}/{prefix}skyhold.redb`:
//! - `{prefix}players`: player id -> encoded [`StoredRow`]
//! - `{prefix}islands`: island id -> player id
//! - `{prefix}player_islands`: player id -> island id (keeps the index exact on moves)
//!
//! redb serializes write transactions, so lock acquisition inside one write
//! transaction is atomic. All I/O runs on the blocking pool.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use skyhold_core::{
    Clock, FetchOutcome, IslandId, LockPolicy, PlayerId, PlayerRecord, RecordCodec, StoredRow,
};
use tracing::{debug, info, warn};

use crate::config::{BackendKind, StorageConfig};
use crate::error::{StorageError, StorageResult};
use crate::storage::backend::StorageBackend;

fn io(err: impl Into<anyhow::Error>) -> StorageError {
    StorageError::io(BackendKind::Redb, err)
}

struct Tables {
    players: String,
    islands: String,
    owners: String,
    #[cfg(test)]
    fail_on: parking_lot::Mutex<Option<PlayerId>>,
}

impl Tables {
    fn new(prefix: &str) -> Self {
        Self {
            players: format!("{prefix}players"),
            islands: format!("{prefix}islands"),
            owners: format!("{prefix}player_islands"),
            #[cfg(test)]
            fail_on: parking_lot::Mutex::new(None),
        }
    }

    fn players(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.players)
    }

    fn islands(&self) -> TableDefinition<'_, i64, &'static str> {
        TableDefinition::new(&self.islands)
    }

    fn owners(&self) -> TableDefinition<'_, &'static str, i64> {
        TableDefinition::new(&self.owners)
    }

    /// Writes one row and keeps both island tables in step.
    fn put(
        &self,
        txn: &WriteTransaction,
        record: &PlayerRecord,
        row: &StoredRow,
    ) -> StorageResult<()> {
        let id = record.id();
        let key = id.to_string();
        let bytes = RecordCodec::encode_row(row).map_err(|e| StorageError::encode(id, e))?;

        let mut players = txn.open_table(self.players()).map_err(io)?;
        players.insert(key.as_str(), bytes.as_slice()).map_err(io)?;

        #[cfg(test)]
        if *self.fail_on.lock() == Some(id) {
            return Err(io(anyhow::anyhow!("injected write failure")));
        }

        let mut islands = txn.open_table(self.islands()).map_err(io)?;
        let mut owners = txn.open_table(self.owners()).map_err(io)?;
        let previous = owners
            .get(key.as_str())
            .map_err(io)?
            .map(|guard| guard.value());
        if let Some(old) = previous.filter(|old| Some(*old) != record.island_id) {
            let owned = islands
                .get(old)
                .map_err(io)?
                .is_some_and(|guard| guard.value() == key);
            if owned {
                islands.remove(old).map_err(io)?;
            }
            owners.remove(key.as_str()).map_err(io)?;
        }
        if let Some(island) = record.island_id {
            islands.insert(island, key.as_str()).map_err(io)?;
            owners.insert(key.as_str(), island).map_err(io)?;
        }
        Ok(())
    }
}

/// Single-file embedded backend.
pub struct RedbBackend {
    path: PathBuf,
    tables: Arc<Tables>,
    policy: LockPolicy,
    clock: Arc<dyn Clock>,
    db: ArcSwapOption<Database>,
}

impl RedbBackend {
    /// Creates a backend for the database file under `config.data_dir`.
    #[must_use]
    pub fn new(config: &StorageConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: config
                .data_dir
                .join(format!("{}skyhold.redb", config.prefix)),
            tables: Arc::new(Tables::new(&config.prefix)),
            policy: config.lock_policy(),
            clock,
            db: ArcSwapOption::empty(),
        }
    }

    fn db(&self) -> StorageResult<Arc<Database>> {
        self.db
            .load_full()
            .ok_or(StorageError::NotReady(BackendKind::Redb))
    }

    /// Runs `op` on the blocking pool with the open database.
    async fn blocking<T, F>(&self, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &Tables) -> StorageResult<T> + Send + 'static,
    {
        let db = self.db()?;
        let tables = Arc::clone(&self.tables);
        tokio::task::spawn_blocking(move || op(&db, &tables))
            .await
            .map_err(io)?
    }
}

fn decode_row(id: PlayerId, bytes: &[u8]) -> StorageResult<(StoredRow, PlayerRecord)> {
    let row = RecordCodec::decode_row(bytes).map_err(|e| StorageError::corrupt(id, e))?;
    let record = RecordCodec::decode(&row.data).map_err(|e| StorageError::corrupt(id, e))?;
    Ok((row, record))
}

#[async_trait]
impl StorageBackend for RedbBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redb
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path = self.path.clone();
        let tables = Arc::clone(&self.tables);
        let db = tokio::task::spawn_blocking(move || -> anyhow::Result<Database> {
            let db = Database::create(&path)?;
            let txn = db.begin_write()?;
            txn.open_table(tables.players())?;
            txn.open_table(tables.islands())?;
            txn.open_table(tables.owners())?;
            txn.commit()?;
            Ok(db)
        })
        .await??;
        self.db.store(Some(Arc::new(db)));
        info!(path = %self.path.display(), "redb backend ready");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.db.load().is_some()
    }

    async fn fetch(&self, id: PlayerId, lock: bool) -> StorageResult<FetchOutcome> {
        let now = self.clock.now_secs();
        let policy = self.policy;
        let outcome = self
            .blocking(move |db, tables| {
                let key = id.to_string();
                if !lock {
                    let txn = db.begin_read().map_err(io)?;
                    let players = txn.open_table(tables.players()).map_err(io)?;
                    let Some(guard) = players.get(key.as_str()).map_err(io)? else {
                        return Ok(FetchOutcome::Absent);
                    };
                    let (_, record) = decode_row(id, guard.value())?;
                    return Ok(FetchOutcome::Available(record));
                }

                let txn = db.begin_write().map_err(io)?;
                let (mut row, record) = {
                    let players = txn.open_table(tables.players()).map_err(io)?;
                    let Some(guard) = players.get(key.as_str()).map_err(io)? else {
                        return Ok(FetchOutcome::Absent);
                    };
                    decode_row(id, guard.value())?
                };
                if policy.is_held(row.lock, now) {
                    return Ok(FetchOutcome::Locked(record));
                }
                row.lock = now;
                {
                    let bytes = RecordCodec::encode_row(&row)
                        .map_err(|e| StorageError::encode(id, e))?;
                    let mut players = txn.open_table(tables.players()).map_err(io)?;
                    players.insert(key.as_str(), bytes.as_slice()).map_err(io)?;
                }
                txn.commit().map_err(io)?;
                Ok(FetchOutcome::Available(record))
            })
            .await;
        if let Err(e) = &outcome {
            if e.is_corrupt() {
                warn!(player = %id, error = %e, "unreadable redb row");
            }
        }
        outcome
    }

    async fn store(&self, record: &PlayerRecord, unlock: bool) -> StorageResult<()> {
        let now = self.clock.now_secs();
        let row = RecordCodec::row_for(record, LockPolicy::stamp_for_store(unlock, now), now)
            .map_err(|e| StorageError::encode(record.id(), e))?;
        let record = record.clone();
        self.blocking(move |db, tables| {
            let txn = db.begin_write().map_err(io)?;
            tables.put(&txn, &record, &row)?;
            txn.commit().map_err(io)
        })
        .await
    }

    async fn store_many(&self, records: &[PlayerRecord], unlock: bool) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let now = self.clock.now_secs();
        let lock = LockPolicy::stamp_for_store(unlock, now);
        let rows = records
            .iter()
            .map(|r| {
                RecordCodec::row_for(r, lock, now)
                    .map(|row| (r.clone(), row))
                    .map_err(|e| StorageError::encode(r.id(), e))
            })
            .collect::<StorageResult<Vec<_>>>()?;
        let count = rows.len();
        let rolled_back = move |e: StorageError| StorageError::BatchRolledBack {
            count,
            source: e.into(),
        };
        self.blocking(move |db, tables| {
            let txn = db.begin_write().map_err(io)?;
            for (record, row) in &rows {
                // An early return drops `txn`, which aborts the whole batch.
                tables.put(&txn, record, row).map_err(&rolled_back)?;
            }
            txn.commit().map_err(|e| rolled_back(io(e)))
        })
        .await
    }

    async fn set_lock(&self, id: PlayerId, lock: bool) -> StorageResult<()> {
        let stamp = LockPolicy::stamp_for_store(!lock, self.clock.now_secs());
        self.blocking(move |db, tables| {
            let key = id.to_string();
            let txn = db.begin_write().map_err(io)?;
            {
                let mut players = txn.open_table(tables.players()).map_err(io)?;
                let existing = players
                    .get(key.as_str())
                    .map_err(io)?
                    .map(|guard| guard.value().to_vec());
                let Some(bytes) = existing else {
                    return Ok(());
                };
                let mut row =
                    RecordCodec::decode_row(&bytes).map_err(|e| StorageError::corrupt(id, e))?;
                row.lock = stamp;
                let bytes = RecordCodec::encode_row(&row).map_err(|e| StorageError::encode(id, e))?;
                players.insert(key.as_str(), bytes.as_slice()).map_err(io)?;
            }
            txn.commit().map_err(io)
        })
        .await
    }

    async fn enumerate_ids(&self) -> StorageResult<HashSet<PlayerId>> {
        self.blocking(|db, tables| {
            let txn = db.begin_read().map_err(io)?;
            let players = txn.open_table(tables.players()).map_err(io)?;
            let mut ids = HashSet::new();
            for entry in players.iter().map_err(io)? {
                let (key, _) = entry.map_err(io)?;
                match key.value().parse() {
                    Ok(id) => {
                        ids.insert(id);
                    }
                    Err(e) => warn!(key = key.value(), error = %e, "skipping malformed redb key"),
                }
            }
            Ok(ids)
        })
        .await
    }

    async fn find_by_island(&self, island_id: IslandId) -> StorageResult<Option<PlayerId>> {
        self.blocking(move |db, tables| {
            let txn = db.begin_read().map_err(io)?;
            let islands = txn.open_table(tables.islands()).map_err(io)?;
            let Some(guard) = islands.get(island_id).map_err(io)? else {
                return Ok(None);
            };
            let raw = guard.value();
            raw.parse()
                .map(Some)
                .map_err(|e| io(anyhow::anyhow!("malformed id {raw:?} in island index: {e}")))
        })
        .await
    }

    async fn close(&self) -> anyhow::Result<()> {
        // The file handle is released when the last in-flight operation drops its Arc.
        if self.db.swap(None).is_some() {
            debug!(path = %self.path.display(), "redb backend closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use skyhold_core::ManualClock;
    use uuid::Uuid;

    use super::*;

    async fn backend(dir: &std::path::Path, clock: Arc<ManualClock>) -> RedbBackend {
        let mut config = StorageConfig::embedded(BackendKind::Redb, dir);
        config.prefix = "t_".to_string();
        let backend = RedbBackend::new(&config, clock);
        backend.initialize().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn round_trip_with_index() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path(), Arc::new(ManualClock::new(10))).await;
        let mut record = PlayerRecord::new(Uuid::new_v4(), "alex").with_island(8);
        record.set("coins", 250);

        assert!(backend.fetch(record.id(), true).await.unwrap().is_absent());
        backend.store(&record, true).await.unwrap();
        let fetched = backend.fetch(record.id(), false).await.unwrap();
        assert_eq!(fetched.into_available(), Some(record.clone()));
        assert_eq!(backend.find_by_island(8).await.unwrap(), Some(record.id()));

        record.island_id = Some(9);
        backend.store(&record, true).await.unwrap();
        assert_eq!(backend.find_by_island(8).await.unwrap(), None);
        assert_eq!(backend.find_by_island(9).await.unwrap(), Some(record.id()));
        assert_eq!(
            backend.enumerate_ids().await.unwrap(),
            HashSet::from([record.id()])
        );
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released_or_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let backend = backend(tmp.path(), clock.clone()).await;
        let record = PlayerRecord::new(Uuid::new_v4(), "steve");
        backend.store(&record, true).await.unwrap();

        assert!(!backend.fetch(record.id(), true).await.unwrap().is_locked());
        clock.advance(3);
        assert!(backend.fetch(record.id(), true).await.unwrap().is_locked());

        backend.set_lock(record.id(), false).await.unwrap();
        assert!(!backend.fetch(record.id(), true).await.unwrap().is_locked());

        clock.advance(31);
        assert!(!backend.fetch(record.id(), true).await.unwrap().is_locked());
    }

    #[tokio::test]
    async fn batch_is_applied_together() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path(), Arc::new(ManualClock::new(10))).await;
        let records: Vec<_> = (0..5)
            .map(|i| PlayerRecord::new(Uuid::new_v4(), format!("p{i}")).with_island(i))
            .collect();
        backend.store_many(&records, false).await.unwrap();

        assert_eq!(backend.enumerate_ids().await.unwrap().len(), 5);
        for record in &records {
            assert!(backend.fetch(record.id(), true).await.unwrap().is_locked());
        }
    }

    #[tokio::test]
    async fn failed_batch_changes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path(), Arc::new(ManualClock::new(10))).await;
        let originals: Vec<_> = (0..4)
            .map(|i| PlayerRecord::new(Uuid::new_v4(), format!("p{i}")).with_island(i))
            .collect();
        backend.store_many(&originals, true).await.unwrap();

        *backend.tables.fail_on.lock() = Some(originals[2].id());
        let updated: Vec<_> = originals
            .iter()
            .map(|r| {
                let mut r = r.clone().with_island(r.island_id.unwrap_or(0) + 100);
                r.set("level", 99);
                r
            })
            .collect();
        let err = backend.store_many(&updated, false).await.unwrap_err();
        assert!(matches!(err, StorageError::BatchRolledBack { count: 4, .. }));

        *backend.tables.fail_on.lock() = None;
        for (i, original) in (0..).zip(&originals) {
            let stored = backend.fetch(original.id(), false).await.unwrap();
            assert_eq!(stored.record(), Some(original));
            assert_eq!(backend.find_by_island(i).await.unwrap(), Some(original.id()));
            assert_eq!(backend.find_by_island(i + 100).await.unwrap(), None);
            assert!(!backend.fetch(original.id(), true).await.unwrap().is_locked());
        }
    }

    #[tokio::test]
    async fn closed_backend_is_not_ready() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path(), Arc::new(ManualClock::new(10))).await;
        backend.close().await.unwrap();
        assert!(!backend.is_ready());
        assert!(matches!(
            backend.enumerate_ids().await,
            Err(StorageError::NotReady(BackendKind::Redb))
        ));
    }
}
