//! Load/save lifecycle of online players.
//!
//! [`StorageManager`] composes the active [`StorageBackend`], the optional
//! [`HandoffChannel`], the [`OnlineCache`] and the batch [`Flusher`]:
//!
//! - **activate**: cache hit, else handoff payload, else `fetch(id, lock)`
//!   with bounded retries on contention, else a synthesized record inserted
//!   in the background
//! - **deactivate**: raise the handoff token, store with unlock, drop from
//!   cache, then publish the payload; the receiving process stamps the lock
//!   itself once it adopts the payload
//! - **flush**: `store_many` over every online record
//! - **shutdown** / **reload**: flush with unlock, then tear the backend down
//!
//! All operations for one player are serialized; concurrent activations of
//! the same player share a single backend round-trip.

pub mod flusher;
pub mod online;
pub mod pending;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::Mutex;
use skyhold_core::{FetchOutcome, IslandId, PlayerId, PlayerRecord, RecordCodec};
use tokio::sync::{mpsc, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ManagerConfig, SkyholdConfig, StorageConfig};
use crate::error::StorageResult;
use crate::handoff::{ControlKind, ControlMessage, HandoffChannel};
use crate::keyed_lock::KeyedLock;
use crate::storage::{BackendFactory, StorageBackend};

pub use flusher::Flusher;
pub use online::{OnlineCache, OnlineHandle};
pub use pending::{PendingInserts, PendingTicket};

/// Where an activated record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    /// Already online in this process.
    Cache,
    /// Transferred from another process through the handoff channel.
    Handoff,
    /// Fetched from the durable backend with the lock taken.
    Backend,
    /// First-time player; a default record was synthesized.
    Created,
}

/// Result of [`StorageManager::activate`].
#[derive(Clone)]
pub enum ActivationOutcome {
    /// The player is online and `handle` is the single in-memory copy.
    Loaded {
        /// Shared handle to the online record.
        handle: OnlineHandle,
        /// Where the record came from.
        source: RecordSource,
    },
    /// The record stayed locked by another holder through every retry.
    /// The player proceeds without cached state.
    Abandoned,
    /// The backend failed or returned an unreadable record.
    Failed,
    /// The backend is not ready or the manager is shut down.
    Refused,
}

impl ActivationOutcome {
    /// The online handle, if the player was loaded.
    #[must_use]
    pub fn handle(&self) -> Option<&OnlineHandle> {
        match self {
            ActivationOutcome::Loaded { handle, .. } => Some(handle),
            _ => None,
        }
    }

    /// Source of a loaded record.
    #[must_use]
    pub fn source(&self) -> Option<RecordSource> {
        match self {
            ActivationOutcome::Loaded { source, .. } => Some(*source),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ActivationOutcome::Loaded { source, .. } => match source {
                RecordSource::Cache => "cache",
                RecordSource::Handoff => "handoff",
                RecordSource::Backend => "backend",
                RecordSource::Created => "created",
            },
            ActivationOutcome::Abandoned => "abandoned",
            ActivationOutcome::Failed => "failed",
            ActivationOutcome::Refused => "refused",
        }
    }
}

impl fmt::Debug for ActivationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationOutcome::Loaded { handle, source } => f
                .debug_struct("Loaded")
                .field("player", &handle.read().id())
                .field("source", source)
                .finish(),
            other => f.write_str(other.label()),
        }
    }
}

/// Result of [`StorageManager::deactivate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeactivationOutcome {
    /// Stored durably with the lock released.
    Stored,
    /// Published to the handoff channel and stored durably.
    HandedOff,
    /// The durable write failed. The lock self-heals after its TTL.
    Failed,
    /// The player was not online.
    NotOnline,
}

struct Inner {
    config: ManagerConfig,
    server_group: String,
    backend: ArcSwap<Arc<dyn StorageBackend>>,
    handoff: Option<Arc<dyn HandoffChannel>>,
    factory: BackendFactory,
    online: OnlineCache,
    pending: Arc<PendingInserts>,
    inflight: DashMap<PlayerId, Arc<OnceCell<ActivationOutcome>>>,
    ops: KeyedLock<PlayerId>,
    flush_gate: RwLock<()>,
    flusher: Mutex<Option<Flusher>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    joined: AtomicBool,
    closed: AtomicBool,
}

/// Orchestrator of the online player population for one process.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct StorageManager {
    inner: Arc<Inner>,
}

impl StorageManager {
    /// Creates a manager without a handoff channel. The backend should
    /// already be initialized; a not-ready backend makes every activation
    /// return [`ActivationOutcome::Refused`].
    #[must_use]
    pub fn new(config: ManagerConfig, backend: Arc<dyn StorageBackend>) -> Self {
        Self::build(config, backend, None, String::new(), BackendFactory::system())
    }

    /// Creates a manager sharing players with other processes of `server_group`.
    #[must_use]
    pub fn with_handoff(
        config: ManagerConfig,
        backend: Arc<dyn StorageBackend>,
        channel: Arc<dyn HandoffChannel>,
        server_group: impl Into<String>,
    ) -> Self {
        Self::build(
            config,
            backend,
            Some(channel),
            server_group.into(),
            BackendFactory::system(),
        )
    }

    /// Builds a server node from one configuration document: see
    /// [`open`](Self::open), then announces this process to its group.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub async fn start(config: SkyholdConfig) -> anyhow::Result<Self> {
        let manager = Self::open(config).await?;
        manager.join_group().await;
        Ok(manager)
    }

    /// Creates and initializes the backend and connects the handoff channel
    /// if enabled, without announcing anything to the group. When the
    /// backend is Redis on the handoff server, both share one connection.
    ///
    /// # Errors
    ///
    /// Fails if the storage configuration is structurally invalid or the
    /// enabled handoff channel cannot connect. A backend that fails to
    /// initialize is not an error; activations are refused until a reload.
    pub async fn open(config: SkyholdConfig) -> anyhow::Result<Self> {
        let factory = BackendFactory::system();
        let (backend, channel) = open_storage(&factory, &config).await?;
        let group = config.handoff.server_group.clone();
        Ok(Self::build(config.manager, backend, channel, group, factory))
    }

    /// Announces this process to its group. [`shutdown`](Self::shutdown)
    /// announces the departure only after this was called.
    pub async fn join_group(&self) {
        if !self.inner.joined.swap(true, Ordering::AcqRel) {
            self.announce(ControlKind::Started).await;
        }
    }

    fn build(
        config: ManagerConfig,
        backend: Arc<dyn StorageBackend>,
        handoff: Option<Arc<dyn HandoffChannel>>,
        server_group: String,
        factory: BackendFactory,
    ) -> Self {
        let flush_every = config.flush_interval();
        let inner = Arc::new(Inner {
            config,
            server_group,
            backend: ArcSwap::from_pointee(backend),
            handoff,
            factory,
            online: OnlineCache::new(),
            pending: Arc::new(PendingInserts::new()),
            inflight: DashMap::new(),
            ops: KeyedLock::new(),
            flush_gate: RwLock::new(()),
            flusher: Mutex::new(None),
            listener: Mutex::new(None),
            joined: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        if let Some(every) = flush_every {
            let weak = Arc::downgrade(&inner);
            let flusher = Flusher::start(every, move || {
                let weak = Weak::clone(&weak);
                async move {
                    if let Some(inner) = weak.upgrade() {
                        let _ = inner.flush(false).await;
                    }
                }
                .boxed()
            });
            *inner.flusher.lock() = Some(flusher);
            info!(interval_secs = every.as_secs(), "batch flusher started");
        }

        if let Some(channel) = &inner.handoff {
            let listener = spawn_control_listener(Arc::downgrade(&inner), channel.subscribe());
            *inner.listener.lock() = Some(listener);
        }

        Self { inner }
    }

    /// Loads a player into the online cache.
    ///
    /// Concurrent calls for the same player share one load and observe the
    /// same handle. `name` is used only when a new record is synthesized.
    pub async fn activate(&self, id: PlayerId, name: &str) -> ActivationOutcome {
        if let Some(handle) = self.inner.online.get(id) {
            return record_activation(ActivationOutcome::Loaded {
                handle,
                source: RecordSource::Cache,
            });
        }

        let cell = Arc::clone(self.inner.inflight.entry(id).or_default().value());
        let outcome = cell.get_or_init(|| self.inner.load(id, name)).await.clone();
        self.inner
            .inflight
            .remove_if(&id, |_, current| Arc::ptr_eq(current, &cell));
        record_activation(outcome)
    }

    /// Persists and releases an online player.
    pub async fn deactivate(&self, id: PlayerId) -> DeactivationOutcome {
        self.inner.deactivate(id).await
    }

    /// Writes every online record in one batch. Records whose first insert
    /// is still in flight are skipped. Returns the number written.
    ///
    /// # Errors
    ///
    /// Returns the backend failure. Transactional backends have rolled the
    /// whole batch back; the next flush retries it.
    pub async fn flush(&self, unlock: bool) -> StorageResult<usize> {
        self.inner.flush(unlock).await
    }

    /// Stops the flusher, waits for pending inserts, flushes every online
    /// record with its lock released and closes backend and channel.
    /// Further activations are refused. Calling it twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first failure among the final flush and the closes.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(online = self.inner.online.len(), "storage manager shutting down");
        let flusher = self.inner.flusher.lock().take();
        if let Some(mut flusher) = flusher {
            flusher.stop().await;
        }

        self.inner.pending.wait_all().await;
        let flushed = self.inner.flush(true).await;
        self.inner.online.clear();
        if self.inner.joined.load(Ordering::Acquire) {
            self.announce(ControlKind::Stopping).await;
        }

        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
        let backend = self.backend();
        let closed = backend.close().await;
        let channel_closed = match &self.inner.handoff {
            Some(channel) => channel.close().await,
            None => Ok(()),
        };

        flushed?;
        closed?;
        channel_closed
    }

    /// Switches to a backend built from `config`. See [`reload_backend`](Self::reload_backend).
    ///
    /// # Errors
    ///
    /// Fails if `config` is structurally invalid; the current backend is kept.
    pub async fn reload(&self, config: &StorageConfig) -> anyhow::Result<()> {
        let backend = self.inner.factory.create(config)?;
        self.reload_backend(backend).await
    }

    /// Flushes every online record to the current backend with its lock
    /// released, initializes `backend`, swaps it in and closes the old one.
    ///
    /// Online records are not migrated: the cache is emptied and players
    /// load from the new backend on their next activation. If `backend`
    /// fails to initialize it is installed anyway and activations are
    /// refused until the next reload.
    ///
    /// # Errors
    ///
    /// Returns the failure to close the previous backend.
    pub async fn reload_backend(&self, backend: Arc<dyn StorageBackend>) -> anyhow::Result<()> {
        self.inner.pending.wait_all().await;
        if let Err(e) = self.inner.flush(true).await {
            error!(error = %e, "final flush before reload failed");
        }
        self.inner.online.clear();

        if let Err(e) = backend.initialize().await {
            warn!(backend = %backend.kind(), error = %e, "reloaded backend failed to initialize");
        }
        let previous = self.inner.backend.swap(Arc::new(backend));
        info!(from = %previous.kind(), to = %self.backend().kind(), "storage backend reloaded");
        previous.close().await
    }

    /// Every stored player id. Maintenance only; may scan the whole medium.
    ///
    /// # Errors
    ///
    /// Returns the backend failure.
    pub async fn enumerate_ids(&self) -> StorageResult<Vec<PlayerId>> {
        let mut ids: Vec<_> = self.backend().enumerate_ids().await?.into_iter().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Owner of `island_id`.
    ///
    /// # Errors
    ///
    /// Returns the backend failure.
    pub async fn resolve_island(&self, island_id: IslandId) -> StorageResult<Option<PlayerId>> {
        self.backend().find_by_island(island_id).await
    }

    /// Drops cached lookup state for a player here and, through the control
    /// stream, in every other process of the group.
    ///
    /// # Errors
    ///
    /// Fails if the broadcast cannot be sent. The local cache is dropped regardless.
    pub async fn invalidate(&self, id: PlayerId) -> anyhow::Result<()> {
        self.backend().invalidate(id);
        self.broadcast(ControlKind::Invalidate { player: id }).await
    }

    /// Island counterpart of [`invalidate`](Self::invalidate).
    ///
    /// # Errors
    ///
    /// Fails if the broadcast cannot be sent. The local cache is dropped regardless.
    pub async fn invalidate_island(&self, island_id: IslandId) -> anyhow::Result<()> {
        self.backend().invalidate_island(island_id);
        self.broadcast(ControlKind::InvalidateIsland { island: island_id })
            .await
    }

    /// How long the durable insert of a just-created record has been in flight.
    #[must_use]
    pub fn pending_insert_age(&self, id: PlayerId) -> Option<Duration> {
        self.inner.pending.age(id)
    }

    /// Handle of an online player.
    #[must_use]
    pub fn online(&self, id: PlayerId) -> Option<OnlineHandle> {
        self.inner.online.get(id)
    }

    /// Number of online players.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.inner.online.len()
    }

    /// The active backend.
    #[must_use]
    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.inner.backend()
    }

    /// Whether activations are currently accepted.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire) && self.backend().is_ready()
    }

    async fn broadcast(&self, kind: ControlKind) -> anyhow::Result<()> {
        let Some(channel) = &self.inner.handoff else {
            return Ok(());
        };
        let message = ControlMessage::new(
            self.inner.server_group.clone(),
            self.inner.config.node_id.clone(),
            kind,
        );
        channel.broadcast(&message).await
    }

    async fn announce(&self, kind: ControlKind) {
        if let Err(e) = self.broadcast(kind).await {
            warn!(error = %e, "control broadcast failed");
        }
    }
}

impl Inner {
    fn backend(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.backend.load())
    }

    async fn load(&self, id: PlayerId, name: &str) -> ActivationOutcome {
        let backend = self.backend();
        if self.closed.load(Ordering::Acquire) || !backend.is_ready() {
            warn!(player = %id, backend = %backend.kind(), "activation refused: backend not ready");
            return ActivationOutcome::Refused;
        }

        let _op = self.ops.lock(id).await;
        if let Some(handle) = self.online.get(id) {
            return ActivationOutcome::Loaded {
                handle,
                source: RecordSource::Cache,
            };
        }

        if let Some(record) = self.take_handoff(id).await {
            let handle = self.online.adopt(record);
            // The sender stored with the lock released before publishing.
            if let Err(e) = backend.set_lock(id, true).await {
                warn!(player = %id, backend = %backend.kind(), error = %e, "lock stamp after handoff failed");
            }
            return ActivationOutcome::Loaded {
                handle,
                source: RecordSource::Handoff,
            };
        }

        let attempts = self.config.lock_retry_attempts.max(1);
        for attempt in 1..=attempts {
            match backend.fetch(id, true).await {
                Ok(FetchOutcome::Available(record)) => {
                    debug!(player = %id, attempt, "record loaded with lock");
                    return ActivationOutcome::Loaded {
                        handle: self.online.adopt(record),
                        source: RecordSource::Backend,
                    };
                }
                Ok(FetchOutcome::Absent) => return self.create(id, name, &backend),
                Ok(FetchOutcome::Locked(_)) => {
                    debug!(player = %id, attempt, "record locked elsewhere");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.lock_retry_interval()).await;
                    }
                }
                Err(e) => {
                    error!(player = %id, backend = %backend.kind(), error = %e, "activation fetch failed");
                    return ActivationOutcome::Failed;
                }
            }
        }

        warn!(player = %id, attempts, "record still locked after retries; proceeding without cached state");
        ActivationOutcome::Abandoned
    }

    fn create(&self, id: PlayerId, name: &str, backend: &Arc<dyn StorageBackend>) -> ActivationOutcome {
        let record = PlayerRecord::new(id, name);
        let handle = self.online.adopt(record.clone());
        if let Some(ticket) = self.pending.begin(id) {
            let backend = Arc::clone(backend);
            let pending = Arc::clone(&self.pending);
            tokio::spawn(async move {
                if let Err(e) = backend.store(&record, false).await {
                    error!(player = %ticket.id(), error = %e, "insert of new record failed");
                }
                pending.finish(ticket);
            });
        }
        info!(player = %id, "created record for first-time player");
        ActivationOutcome::Loaded {
            handle,
            source: RecordSource::Created,
        }
    }

    async fn take_handoff(&self, id: PlayerId) -> Option<PlayerRecord> {
        let channel = self.handoff.as_ref()?;
        match channel.is_pending(id).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!(player = %id, error = %e, "handoff token check failed");
                return None;
            }
        }

        let polls = self.config.handoff_poll_attempts.max(1);
        for poll in 1..=polls {
            match channel.take_payload(id).await {
                Ok(Some(bytes)) => {
                    if let Err(e) = channel.clear(id).await {
                        warn!(player = %id, error = %e, "handoff token clear failed");
                    }
                    return match RecordCodec::decode(&bytes) {
                        Ok(record) => {
                            metrics::counter!("skyhold_handoff_total", "result" => "hit").increment(1);
                            debug!(player = %id, poll, "adopted handed-off record");
                            Some(record)
                        }
                        Err(e) => {
                            warn!(player = %id, error = %e, "unreadable handoff payload");
                            None
                        }
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(player = %id, error = %e, "handoff payload read failed");
                    break;
                }
            }
            if poll < polls {
                tokio::time::sleep(self.config.handoff_poll_interval()).await;
            }
        }

        metrics::counter!("skyhold_handoff_total", "result" => "expired").increment(1);
        debug!(player = %id, "handoff payload never arrived; using backend");
        if let Err(e) = channel.clear(id).await {
            warn!(player = %id, error = %e, "handoff token clear failed");
        }
        None
    }

    async fn deactivate(&self, id: PlayerId) -> DeactivationOutcome {
        let _op = self.ops.lock(id).await;
        let Some(handle) = self.online.get(id) else {
            return DeactivationOutcome::NotOnline;
        };
        self.pending.wait(id).await;
        let record = handle.read().clone();

        // Token first: a fast-following activation elsewhere waits for the
        // payload instead of finding the row still locked by us.
        if let Some(channel) = &self.handoff {
            if let Err(e) = channel.mark_pending(id).await {
                warn!(player = %id, error = %e, "handoff token publish failed");
            }
        }

        let stored = {
            let _gate = self.flush_gate.read().await;
            let stored = self.backend().store(&record, true).await;
            // A flush waiting on the gate must not see the entry and restamp the lock.
            self.online.remove(id);
            stored
        };

        let mut handed_off = false;
        if let Some(channel) = &self.handoff {
            match RecordCodec::encode(&record) {
                Ok(payload) => match channel.publish(id, payload).await {
                    Ok(()) => handed_off = true,
                    Err(e) => warn!(player = %id, error = %e, "handoff publish failed"),
                },
                Err(e) => warn!(player = %id, error = %e, "handoff payload encode failed"),
            }
        }

        match stored {
            Ok(()) if handed_off => DeactivationOutcome::HandedOff,
            Ok(()) => DeactivationOutcome::Stored,
            Err(e) => {
                error!(player = %id, error = %e, "deactivation store failed; lock expires by TTL");
                DeactivationOutcome::Failed
            }
        }
    }

    async fn flush(&self, unlock: bool) -> StorageResult<usize> {
        let _gate = self.flush_gate.write().await;
        let records = self.online.snapshot(|id| !self.pending.contains(id));
        if records.is_empty() {
            return Ok(0);
        }

        let backend = self.backend();
        let started = Instant::now();
        let result = backend.store_many(&records, unlock).await;
        metrics::histogram!("skyhold_flush_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                #[allow(clippy::cast_precision_loss)]
                metrics::histogram!("skyhold_flush_records").record(records.len() as f64);
                debug!(count = records.len(), unlock, "batch flush complete");
                Ok(records.len())
            }
            Err(e) => {
                error!(count = records.len(), backend = %backend.kind(), error = %e, "batch flush failed; next flush retries");
                Err(e)
            }
        }
    }

    fn apply_control(&self, message: &ControlMessage) {
        match &message.kind {
            ControlKind::Started => info!(node = %message.origin, "peer joined group"),
            ControlKind::Stopping => info!(node = %message.origin, "peer leaving group"),
            ControlKind::Invalidate { player } => {
                debug!(node = %message.origin, player = %player, "remote invalidation");
                self.backend().invalidate(*player);
            }
            ControlKind::InvalidateIsland { island } => {
                debug!(node = %message.origin, island, "remote island invalidation");
                self.backend().invalidate_island(*island);
            }
        }
    }
}

fn record_activation(outcome: ActivationOutcome) -> ActivationOutcome {
    metrics::counter!("skyhold_activations_total", "outcome" => outcome.label()).increment(1);
    outcome
}

fn spawn_control_listener(
    inner: Weak<Inner>,
    mut messages: mpsc::UnboundedReceiver<ControlMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if message.is_for(&inner.server_group, &inner.config.node_id) {
                inner.apply_control(&message);
            }
        }
    })
}

type Opened = (Arc<dyn StorageBackend>, Option<Arc<dyn HandoffChannel>>);

#[cfg(feature = "redis")]
async fn open_storage(factory: &BackendFactory, config: &SkyholdConfig) -> anyhow::Result<Opened> {
    use crate::handoff::{RedisConnector, RedisEndpoint, RedisHandoffChannel};

    if !config.handoff.enabled {
        return Ok((factory.create_initialized(&config.storage).await?, None));
    }
    let endpoint = RedisEndpoint::from_handoff(&config.handoff);
    let connector = Arc::new(RedisConnector::connect(endpoint, config.handoff.pool_size).await?);
    let channel = RedisHandoffChannel::with_connector(Arc::clone(&connector), &config.handoff).await?;
    let backend = factory
        .create_initialized_sharing(&config.storage, &connector)
        .await?;
    Ok((backend, Some(Arc::new(channel))))
}

#[cfg(not(feature = "redis"))]
async fn open_storage(factory: &BackendFactory, config: &SkyholdConfig) -> anyhow::Result<Opened> {
    if config.handoff.enabled {
        warn!("handoff enabled but redis support is not compiled in; using backend only");
    }
    Ok((factory.create_initialized(&config.storage).await?, None))
}
