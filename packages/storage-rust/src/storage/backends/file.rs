//! One-file-per-player backends (JSON and YAML).
//!
//! Each record lives at `{data_dir}/{prefix}players/{uuid}.{ext}`, with a
//! `.zst` suffix when compression is enabled. Reads fall back to the other
//! variant so toggling compression does not strand existing files. Writes go
//! to a hidden temp file that is then renamed over the target, so readers
//! never observe a half-written document.
//!
//! There is no native secondary index: island lookups scan the directory and
//! remember what they resolve in an [`IslandIndexCache`].
//!
//! Every read-modify-write of a player's document holds an exclusive OS lock
//! on `.{uuid}.lock` beside it, so processes sharing the directory on one
//! host exclude each other. Advisory locks are not reliable across network
//! filesystems; share a directory between hosts only through a relational or
//! key-value backend instead.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use skyhold_core::{Clock, FetchOutcome, IslandId, LockPolicy, PlayerId, PlayerRecord};
use tracing::{debug, warn};

use crate::config::{BackendKind, StorageConfig};
use crate::error::{StorageError, StorageResult};
use crate::keyed_lock::KeyedLock;
use crate::storage::backend::StorageBackend;
use crate::storage::index_cache::IslandIndexCache;

const COMPRESSED_SUFFIX: &str = "zst";
const COMPRESSION_LEVEL: i32 = 3;

/// On-disk document: the record plus its persistence metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDocument {
    /// Lock stamp in epoch seconds, 0 when released.
    pub lock: i64,
    /// Epoch seconds of the last write.
    #[serde(default)]
    pub written_at: i64,
    /// The player record.
    pub record: PlayerRecord,
}

/// Text encoding used by a [`FileBackend`].
pub trait FileFormat: Send + Sync + 'static {
    /// Backend kind reported for this format.
    const KIND: BackendKind;
    /// File extension, without the leading dot.
    const EXTENSION: &'static str;

    /// Serializes a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be represented in this format.
    fn to_bytes(doc: &FileDocument) -> anyhow::Result<Vec<u8>>;

    /// Parses a document.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed input.
    fn from_bytes(bytes: &[u8]) -> anyhow::Result<FileDocument>;
}

/// Pretty-printed JSON documents.
pub struct Json;

impl FileFormat for Json {
    const KIND: BackendKind = BackendKind::Json;
    const EXTENSION: &'static str = "json";

    fn to_bytes(doc: &FileDocument) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(doc)?)
    }

    fn from_bytes(bytes: &[u8]) -> anyhow::Result<FileDocument> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// YAML documents.
pub struct Yaml;

impl FileFormat for Yaml {
    const KIND: BackendKind = BackendKind::Yaml;
    const EXTENSION: &'static str = "yml";

    fn to_bytes(doc: &FileDocument) -> anyhow::Result<Vec<u8>> {
        Ok(serde_yaml::to_string(doc)?.into_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> anyhow::Result<FileDocument> {
        Ok(serde_yaml::from_slice(bytes)?)
    }
}

/// JSON file backend.
pub type JsonFileBackend = FileBackend<Json>;
/// YAML file backend.
pub type YamlFileBackend = FileBackend<Yaml>;

/// Directory of per-player documents in format `F`.
pub struct FileBackend<F: FileFormat> {
    dir: PathBuf,
    compress: bool,
    policy: LockPolicy,
    clock: Arc<dyn Clock>,
    index: IslandIndexCache,
    locks: KeyedLock<PlayerId>,
    ready: AtomicBool,
    _format: PhantomData<F>,
}

impl<F: FileFormat> FileBackend<F> {
    /// Creates a backend rooted at `config.data_dir`.
    #[must_use]
    pub fn new(config: &StorageConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: config.data_dir.join(format!("{}players", config.prefix)),
            compress: config.compress,
            policy: config.lock_policy(),
            clock,
            index: IslandIndexCache::new(&config.index_cache),
            locks: KeyedLock::new(),
            ready: AtomicBool::new(false),
            _format: PhantomData,
        }
    }

    /// Directory holding the documents.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a record is written to under the current compression setting.
    #[must_use]
    pub fn path_for(&self, id: PlayerId) -> PathBuf {
        self.variant_path(id, self.compress)
    }

    fn variant_path(&self, id: PlayerId, compressed: bool) -> PathBuf {
        if compressed {
            self.dir
                .join(format!("{id}.{}.{COMPRESSED_SUFFIX}", F::EXTENSION))
        } else {
            self.dir.join(format!("{id}.{}", F::EXTENSION))
        }
    }

    fn ensure_ready(&self) -> StorageResult<()> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::NotReady(F::KIND))
        }
    }

    fn io(err: impl Into<anyhow::Error>) -> StorageError {
        StorageError::io(F::KIND, err)
    }

    fn encode(doc: &FileDocument, compressed: bool) -> anyhow::Result<Vec<u8>> {
        let bytes = F::to_bytes(doc)?;
        if compressed {
            zstd::encode_all(bytes.as_slice(), COMPRESSION_LEVEL).context("zstd compression failed")
        } else {
            Ok(bytes)
        }
    }

    fn decode(bytes: &[u8], compressed: bool) -> anyhow::Result<FileDocument> {
        if compressed {
            let plain = zstd::decode_all(bytes).context("zstd decompression failed")?;
            F::from_bytes(&plain)
        } else {
            F::from_bytes(bytes)
        }
    }

    /// Reads the document at `path`, or `None` if it does not exist.
    async fn read_path(&self, path: &Path) -> StorageResult<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io(e)),
        }
    }

    /// Loads a record's document, preferring the configured variant.
    async fn load(&self, id: PlayerId) -> StorageResult<Option<FileDocument>> {
        for compressed in [self.compress, !self.compress] {
            let Some(bytes) = self.read_path(&self.variant_path(id, compressed)).await? else {
                continue;
            };
            let doc = Self::decode(&bytes, compressed).map_err(|e| {
                warn!(player = %id, backend = %F::KIND, error = %e, "unreadable player file");
                StorageError::corrupt(id, e)
            })?;
            if doc.record.id() != id {
                return Err(StorageError::corrupt(
                    id,
                    anyhow::anyhow!("file holds record for {}", doc.record.id()),
                ));
            }
            return Ok(Some(doc));
        }
        Ok(None)
    }

    /// Writes a document atomically and removes the other variant.
    async fn save(&self, doc: &FileDocument) -> StorageResult<()> {
        let id = doc.record.id();
        let bytes = Self::encode(doc, self.compress).map_err(|e| StorageError::encode(id, e))?;

        let target = self.path_for(id);
        let tmp = self.dir.join(format!(".{id}.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await.map_err(Self::io)?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Self::io(e));
        }

        match tokio::fs::remove_file(self.variant_path(id, !self.compress)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(Self::io(e)),
        }

        self.index.observe(id, doc.record.island_id);
        Ok(())
    }

    /// Takes the cross-process lock for one player's document. Released when
    /// the returned file is dropped.
    async fn lock_file(&self, id: PlayerId) -> StorageResult<File> {
        let path = self.dir.join(format!(".{id}.lock"));
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok::<_, std::io::Error>(file)
        })
        .await
        .map_err(Self::io)?
        .map_err(Self::io)
    }

    async fn write_record(&self, record: &PlayerRecord, unlock: bool) -> StorageResult<()> {
        let _guard = self.locks.lock(record.id()).await;
        let _os = self.lock_file(record.id()).await?;
        let now = self.clock.now_secs();
        self.save(&FileDocument {
            lock: LockPolicy::stamp_for_store(unlock, now),
            written_at: now,
            record: record.clone(),
        })
        .await
    }

    /// Parses the player id out of a document file name.
    fn id_from_file_name(name: &str) -> Option<PlayerId> {
        if name.starts_with('.') {
            return None;
        }
        let (stem, rest) = name.split_once('.')?;
        let rest = rest
            .strip_suffix(COMPRESSED_SUFFIX)
            .and_then(|r| r.strip_suffix('.'))
            .unwrap_or(rest);
        if rest != F::EXTENSION {
            return None;
        }
        stem.parse().ok()
    }

    async fn list_ids(&self) -> StorageResult<HashSet<PlayerId>> {
        let mut ids = HashSet::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await.map_err(Self::io)?;
        while let Some(entry) = dir.next_entry().await.map_err(Self::io)? {
            if let Some(id) = entry.file_name().to_str().and_then(Self::id_from_file_name) {
                ids.insert(id);
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl<F: FileFormat> StorageBackend for FileBackend<F> {
    fn kind(&self) -> BackendKind {
        F::KIND
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("cannot create {}", self.dir.display()))?;
        self.ready.store(true, Ordering::Release);
        debug!(backend = %F::KIND, dir = %self.dir.display(), "file backend ready");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn fetch(&self, id: PlayerId, lock: bool) -> StorageResult<FetchOutcome> {
        self.ensure_ready()?;
        let _guard = self.locks.lock(id).await;
        let _os = self.lock_file(id).await?;
        let Some(mut doc) = self.load(id).await? else {
            return Ok(FetchOutcome::Absent);
        };
        if !lock {
            return Ok(FetchOutcome::Available(doc.record));
        }
        let now = self.clock.now_secs();
        if self.policy.is_held(doc.lock, now) {
            return Ok(FetchOutcome::Locked(doc.record));
        }
        doc.lock = now;
        self.save(&doc).await?;
        Ok(FetchOutcome::Available(doc.record))
    }

    async fn store(&self, record: &PlayerRecord, unlock: bool) -> StorageResult<()> {
        self.ensure_ready()?;
        self.write_record(record, unlock).await
    }

    async fn store_many(&self, records: &[PlayerRecord], unlock: bool) -> StorageResult<()> {
        self.ensure_ready()?;
        let mut first_error = None;
        for record in records {
            if let Err(e) = self.write_record(record, unlock).await {
                warn!(player = %record.id(), backend = %F::KIND, error = %e, "batch item failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn set_lock(&self, id: PlayerId, lock: bool) -> StorageResult<()> {
        self.ensure_ready()?;
        let _guard = self.locks.lock(id).await;
        let _os = self.lock_file(id).await?;
        if let Some(mut doc) = self.load(id).await? {
            doc.lock = LockPolicy::stamp_for_store(!lock, self.clock.now_secs());
            self.save(&doc).await?;
        }
        Ok(())
    }

    async fn enumerate_ids(&self) -> StorageResult<HashSet<PlayerId>> {
        self.ensure_ready()?;
        self.list_ids().await
    }

    async fn find_by_island(&self, island_id: IslandId) -> StorageResult<Option<PlayerId>> {
        self.ensure_ready()?;
        if let Some(id) = self.index.get(island_id) {
            return Ok(Some(id));
        }
        debug!(backend = %F::KIND, island = island_id, "island cache miss, scanning");
        let mut found = None;
        for id in self.list_ids().await? {
            match self.load(id).await {
                Ok(Some(doc)) => {
                    if let Some(island) = doc.record.island_id {
                        self.index.insert(island, id);
                        if island == island_id {
                            found = Some(id);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_corrupt() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    fn invalidate(&self, id: PlayerId) {
        self.index.invalidate_player(id);
    }

    fn invalidate_island(&self, island_id: IslandId) {
        self.index.invalidate_island(island_id);
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.ready.store(false, Ordering::Release);
        self.index.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;
    use skyhold_core::{ManualClock, Value};
    use uuid::Uuid;

    use super::*;

    fn config(dir: &Path, kind: BackendKind, compress: bool) -> StorageConfig {
        let mut config = StorageConfig::embedded(kind, dir);
        config.prefix = "t_".to_string();
        config.compress = compress;
        config
    }

    async fn json(dir: &Path, compress: bool, clock: Arc<ManualClock>) -> JsonFileBackend {
        let backend = JsonFileBackend::new(&config(dir, BackendKind::Json, compress), clock);
        backend.initialize().await.unwrap();
        backend
    }

    fn sample(name: &str) -> PlayerRecord {
        let mut record = PlayerRecord::new(Uuid::new_v4(), name).with_island(42);
        record.set("level", 7);
        record.set("title", "skyward");
        record.set("ratio", Value::Float(0.5));
        record
    }

    #[tokio::test]
    async fn json_round_trip_and_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = json(tmp.path(), false, Arc::new(ManualClock::new(100))).await;
        let record = sample("alex");

        backend.store(&record, true).await.unwrap();
        assert!(tmp
            .path()
            .join("t_players")
            .join(format!("{}.json", record.id()))
            .exists());

        let fetched = backend.fetch(record.id(), false).await.unwrap();
        assert_eq!(fetched.into_available(), Some(record));
    }

    #[tokio::test]
    async fn yaml_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let backend =
            YamlFileBackend::new(&config(tmp.path(), BackendKind::Yaml, false), Arc::new(ManualClock::new(1)));
        backend.initialize().await.unwrap();
        let record = sample("steve");

        backend.store(&record, true).await.unwrap();
        assert!(backend.path_for(record.id()).ends_with(format!("{}.yml", record.id())));
        let fetched = backend.fetch(record.id(), true).await.unwrap();
        assert_eq!(fetched.into_available(), Some(record));
    }

    #[tokio::test]
    async fn compressed_files_carry_suffix_and_migrate() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(100));
        let record = sample("alex");

        let plain = json(tmp.path(), false, clock.clone()).await;
        plain.store(&record, true).await.unwrap();

        let packed = json(tmp.path(), true, clock).await;
        let fetched = packed.fetch(record.id(), false).await.unwrap();
        assert_eq!(fetched.record(), Some(&record));

        packed.store(&record, true).await.unwrap();
        let path = packed.path_for(record.id());
        assert!(path.to_string_lossy().ends_with(".json.zst"));
        assert!(path.exists());
        assert!(!plain.path_for(record.id()).exists());
        assert_eq!(
            packed.enumerate_ids().await.unwrap(),
            HashSet::from([record.id()])
        );
    }

    #[tokio::test]
    async fn two_instances_exclude_each_other_until_release() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let a = json(tmp.path(), false, clock.clone()).await;
        let b = json(tmp.path(), false, clock.clone()).await;
        let mut record = sample("p1");
        a.store(&record, true).await.unwrap();

        let held = a.fetch(record.id(), true).await.unwrap();
        assert!(!held.is_locked());

        clock.advance(5);
        assert!(b.fetch(record.id(), true).await.unwrap().is_locked());

        record.set("level", 8);
        a.store(&record, true).await.unwrap();
        let retried = b.fetch(record.id(), true).await.unwrap();
        assert_eq!(retried.into_available(), Some(record));
    }

    #[tokio::test]
    async fn stale_lock_self_heals() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let a = json(tmp.path(), false, clock.clone()).await;
        let b = json(tmp.path(), false, clock.clone()).await;
        let record = sample("crashed");
        a.store(&record, false).await.unwrap();

        clock.advance(31);
        assert!(!b.fetch(record.id(), true).await.unwrap().is_locked());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported_not_half_decoded() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = json(tmp.path(), false, Arc::new(ManualClock::new(1))).await;
        let id = Uuid::new_v4();
        std::fs::write(backend.path_for(id), b"{ not json").unwrap();

        let err = backend.fetch(id, true).await.unwrap_err();
        assert!(err.is_corrupt());
    }

    #[tokio::test]
    async fn island_lookup_scans_then_caches() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = json(tmp.path(), false, Arc::new(ManualClock::new(1))).await;
        let a = PlayerRecord::new(Uuid::new_v4(), "a").with_island(1);
        let b = PlayerRecord::new(Uuid::new_v4(), "b").with_island(2);
        backend.store_many(&[a.clone(), b.clone()], true).await.unwrap();

        // Drop what the writes cached so the lookup has to scan.
        backend.invalidate(a.id());
        backend.invalidate_island(2);
        assert_eq!(backend.find_by_island(2).await.unwrap(), Some(b.id()));
        assert_eq!(backend.find_by_island(1).await.unwrap(), Some(a.id()));
        assert_eq!(backend.find_by_island(3).await.unwrap(), None);

        // Cached mapping survives the file going away until invalidated.
        std::fs::remove_file(backend.path_for(a.id())).unwrap();
        assert_eq!(backend.find_by_island(1).await.unwrap(), Some(a.id()));
        backend.invalidate_island(1);
        assert_eq!(backend.find_by_island(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_lock_on_missing_record_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = json(tmp.path(), false, Arc::new(ManualClock::new(1))).await;
        backend.set_lock(Uuid::new_v4(), false).await.unwrap();
        assert!(backend.enumerate_ids().await.unwrap().is_empty());
    }

    #[test]
    fn file_names_parse_to_ids() {
        let id = Uuid::new_v4();
        assert_eq!(JsonFileBackend::id_from_file_name(&format!("{id}.json")), Some(id));
        assert_eq!(JsonFileBackend::id_from_file_name(&format!("{id}.json.zst")), Some(id));
        assert_eq!(JsonFileBackend::id_from_file_name(&format!(".{id}.x.tmp")), None);
        assert_eq!(JsonFileBackend::id_from_file_name(&format!("{id}.yml")), None);
        assert_eq!(JsonFileBackend::id_from_file_name("notes.json"), None);
    }

    #[tokio::test]
    async fn yaml_stores_binary_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let backend =
            YamlFileBackend::new(&config(tmp.path(), BackendKind::Yaml, false), Arc::new(ManualClock::new(1)));
        backend.initialize().await.unwrap();
        let mut record = sample("miner");
        record.set("chunk", Value::Bytes(vec![1, 2, 3]));

        backend.store(&record, true).await.unwrap();
        let fetched = backend.fetch(record.id(), false).await.unwrap();
        assert_eq!(fetched.into_available(), Some(record));
    }

    #[tokio::test]
    async fn json_keeps_non_finite_floats_readable() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = json(tmp.path(), false, Arc::new(ManualClock::new(1))).await;
        let mut record = sample("void");
        record.set("depth", Value::Float(f64::INFINITY));
        record.set("floor", Value::Float(f64::NEG_INFINITY));

        backend.store(&record, true).await.unwrap();
        let fetched = backend.fetch(record.id(), true).await.unwrap();
        assert_eq!(fetched.into_available(), Some(record));
    }

    #[tokio::test]
    async fn os_lock_holds_off_another_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let a = json(tmp.path(), false, clock.clone()).await;
        let b = Arc::new(json(tmp.path(), false, clock).await);
        let record = sample("shared");
        a.store(&record, true).await.unwrap();

        let held = a.lock_file(record.id()).await.unwrap();
        let waiting = {
            let b = Arc::clone(&b);
            let id = record.id();
            tokio::spawn(async move { b.fetch(id, true).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        drop(held);
        let fetched = waiting.await.unwrap().unwrap();
        assert_eq!(fetched.into_available(), Some(record));
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            prop_oneof![
                any::<f64>().prop_filter("NaN never compares equal", |f| !f.is_nan()),
                Just(f64::INFINITY),
                Just(f64::NEG_INFINITY),
            ]
            .prop_map(Value::Float),
            "[ -~]{0,12}".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..24).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::btree_map("[a-z_]{1,6}", inner, 0..4).prop_map(Value::Map),
            ]
        })
    }

    fn arb_document() -> impl Strategy<Value = FileDocument> {
        (
            any::<u128>(),
            proptest::option::of(any::<i64>()),
            0..i64::from(u32::MAX),
            proptest::collection::btree_map("[a-z_]{1,10}", arb_value(), 0..6),
        )
            .prop_map(|(id, island, lock, payload)| {
                let mut record = PlayerRecord::new(Uuid::from_u128(id), "crafter");
                record.island_id = island;
                record.payload = payload;
                FileDocument {
                    lock,
                    written_at: lock,
                    record,
                }
            })
    }

    proptest! {
        #[test]
        fn json_documents_round_trip(doc in arb_document(), compressed in any::<bool>()) {
            let bytes = JsonFileBackend::encode(&doc, compressed).unwrap();
            prop_assert_eq!(JsonFileBackend::decode(&bytes, compressed).unwrap(), doc);
        }

        #[test]
        fn yaml_documents_round_trip(doc in arb_document(), compressed in any::<bool>()) {
            let bytes = YamlFileBackend::encode(&doc, compressed).unwrap();
            prop_assert_eq!(YamlFileBackend::decode(&bytes, compressed).unwrap(), doc);
        }
    }
}
