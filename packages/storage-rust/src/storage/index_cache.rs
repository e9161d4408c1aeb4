//! Island-to-player lookup cache for backends without a native secondary index.
//!
//! File backends resolve islands by scanning every document. [`IslandIndexCache`]
//! keeps resolved mappings so repeated lookups skip the scan. It is bounded in
//! size (`quick_cache` eviction on both directions) and in age (entries older
//! than `max_age` are treated as misses). A forward entry only counts as a hit
//! while the reverse map agrees with it, so evicting either side costs a rescan
//! and never a stale answer.

use std::time::{Duration, Instant};

use quick_cache::sync::Cache;
use skyhold_core::{IslandId, PlayerId};

use crate::config::IndexCacheConfig;

/// Capacity- and age-bounded island lookup cache.
pub struct IslandIndexCache {
    entries: Cache<IslandId, (PlayerId, Instant)>,
    by_player: Cache<PlayerId, IslandId>,
    max_age: Duration,
}

impl IslandIndexCache {
    /// Creates a cache from its configuration. A zero capacity is raised to 1.
    #[must_use]
    pub fn new(config: &IndexCacheConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            entries: Cache::new(capacity),
            by_player: Cache::new(capacity),
            max_age: config.max_age(),
        }
    }

    /// Returns the cached owner of `island_id` if present and not too old.
    #[must_use]
    pub fn get(&self, island_id: IslandId) -> Option<PlayerId> {
        let (player, inserted) = self.entries.get(&island_id)?;
        let current = self.by_player.get(&player) == Some(island_id);
        if !current || inserted.elapsed() > self.max_age {
            self.entries.remove(&island_id);
            if current {
                self.by_player.remove(&player);
            }
            return None;
        }
        Some(player)
    }

    /// Records that `island_id` belongs to `player`.
    pub fn insert(&self, island_id: IslandId, player: PlayerId) {
        if let Some(previous) = self.by_player.get(&player) {
            if previous != island_id {
                self.remove_if_owned(previous, player);
            }
        }
        self.by_player.insert(player, island_id);
        self.entries.insert(island_id, (player, Instant::now()));
    }

    /// Removes the cached entry for `island_id` only if it still maps to `player`.
    fn remove_if_owned(&self, island_id: IslandId, player: PlayerId) {
        if matches!(self.entries.get(&island_id), Some((owner, _)) if owner == player) {
            self.entries.remove(&island_id);
        }
    }

    /// Refreshes the mapping after a record with `island_id` was written.
    pub fn observe(&self, player: PlayerId, island_id: Option<IslandId>) {
        match island_id {
            Some(island) => self.insert(island, player),
            None => self.invalidate_player(player),
        }
    }

    /// Drops the mapping for a player, if any.
    pub fn invalidate_player(&self, player: PlayerId) {
        if let Some((_, island)) = self.by_player.remove(&player) {
            self.remove_if_owned(island, player);
        }
    }

    /// Drops the mapping for an island, if any.
    pub fn invalidate_island(&self, island_id: IslandId) {
        if let Some((_, (player, _))) = self.entries.remove(&island_id) {
            if self.by_player.get(&player) == Some(island_id) {
                self.by_player.remove(&player);
            }
        }
    }

    /// Drops every mapping.
    pub fn clear(&self) {
        self.entries.clear();
        self.by_player.clear();
    }

    /// Number of cached mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no mappings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn cache(capacity: usize, max_age_secs: u64) -> IslandIndexCache {
        IslandIndexCache::new(&IndexCacheConfig {
            capacity,
            max_age_secs,
        })
    }

    #[test]
    fn insert_then_get() {
        let cache = cache(16, 60);
        let player = Uuid::new_v4();
        cache.insert(4, player);
        assert_eq!(cache.get(4), Some(player));
        assert_eq!(cache.get(5), None);
    }

    #[test]
    fn moving_island_drops_old_mapping() {
        let cache = cache(16, 60);
        let player = Uuid::new_v4();
        cache.observe(player, Some(1));
        cache.observe(player, Some(2));
        assert_eq!(cache.get(1), None);
        assert_eq!(cache.get(2), Some(player));
    }

    #[test]
    fn observe_without_island_invalidates() {
        let cache = cache(16, 60);
        let player = Uuid::new_v4();
        cache.observe(player, Some(9));
        cache.observe(player, None);
        assert_eq!(cache.get(9), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_island_and_player() {
        let cache = cache(16, 60);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        cache.insert(1, a);
        cache.insert(2, b);

        cache.invalidate_island(1);
        assert_eq!(cache.get(1), None);

        cache.invalidate_player(b);
        assert_eq!(cache.get(2), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = cache(16, 0);
        cache.insert(3, Uuid::new_v4());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(3), None);
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = cache(8, 60);
        for island in 0..100 {
            cache.insert(island, Uuid::new_v4());
        }
        assert!(cache.len() < 100);
    }

    #[test]
    fn reverse_map_is_bounded_by_capacity() {
        let cache = cache(8, 60);
        for island in 0..1_000 {
            cache.observe(Uuid::new_v4(), Some(island));
        }
        assert!(cache.by_player.len() < 1_000);
        assert!(cache.len() < 1_000);
    }

    #[test]
    fn forward_entry_without_reverse_is_a_miss() {
        let cache = cache(16, 60);
        let player = Uuid::new_v4();
        cache.insert(7, player);
        cache.by_player.remove(&player);

        assert_eq!(cache.get(7), None);
        assert!(cache.is_empty());
    }
}
