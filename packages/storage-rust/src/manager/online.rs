//! In-process map of active players' records.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use skyhold_core::{PlayerId, PlayerRecord};

/// Shared, mutable view of one online record.
///
/// Gameplay code mutates through the lock; the flusher and deactivation
/// take read snapshots.
pub type OnlineHandle = Arc<RwLock<PlayerRecord>>;

/// Sole owner of the in-memory copy of every online record.
#[derive(Default)]
pub struct OnlineCache {
    entries: DashMap<PlayerId, OnlineHandle>,
}

impl OnlineCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle of an online record.
    #[must_use]
    pub fn get(&self, id: PlayerId) -> Option<OnlineHandle> {
        self.entries.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Adopts `record`. If the player is already online the existing handle
    /// wins and `record` is discarded.
    pub fn adopt(&self, record: PlayerRecord) -> OnlineHandle {
        match self.entries.entry(record.id()) {
            Entry::Occupied(e) => Arc::clone(e.get()),
            Entry::Vacant(e) => Arc::clone(&e.insert(Arc::new(RwLock::new(record)))),
        }
    }

    /// Drops a player from the cache.
    pub fn remove(&self, id: PlayerId) -> Option<OnlineHandle> {
        self.entries.remove(&id).map(|(_, handle)| handle)
    }

    /// Whether the player is online.
    #[must_use]
    pub fn contains(&self, id: PlayerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Identifiers of every online player.
    #[must_use]
    pub fn ids(&self) -> Vec<PlayerId> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    /// Point-in-time copies of the online records accepted by `keep`.
    pub fn snapshot(&self, mut keep: impl FnMut(PlayerId) -> bool) -> Vec<PlayerRecord> {
        self.entries
            .iter()
            .filter(|e| keep(*e.key()))
            .map(|e| e.value().read().clone())
            .collect()
    }

    /// Number of online players.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nobody is online.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry. Outstanding handles stay valid but are detached.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
