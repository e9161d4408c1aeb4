//! Redis as the durable key-value store.
//!
//! Layout under `{prefix}`:
//! - `{prefix}player:{uuid}`: hash with `lock`, `data` (encoded record) and `island`
//! - `{prefix}players`: set of every stored id
//! - `{prefix}island:{island_id}`: owning player id
//!
//! Fetch-with-lock and store run as Lua scripts, so lock acquisition and
//! index maintenance are atomic on the server. Batches are written item by item.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use redis::Script;
use skyhold_core::{Clock, FetchOutcome, IslandId, LockPolicy, PlayerId, PlayerRecord, RecordCodec};
use tracing::{info, warn};

use crate::config::{BackendKind, StorageConfig};
use crate::error::{StorageError, StorageResult};
use crate::handoff::connector::{RedisConnector, RedisEndpoint};
use crate::storage::backend::StorageBackend;

/// Returns `{0, ''}` if absent, `{2, data}` if held, else stamps and returns `{1, data}`.
const FETCH_LOCK: &str = r"
local lock = redis.call('HGET', KEYS[1], 'lock')
if not lock then return {0, ''} end
local data = redis.call('HGET', KEYS[1], 'data') or ''
local now = tonumber(ARGV[1])
local stamp = tonumber(lock) or 0
if stamp ~= 0 and now - stamp <= tonumber(ARGV[2]) then return {2, data} end
redis.call('HSET', KEYS[1], 'lock', ARGV[1])
return {1, data}
";

/// KEYS: player hash, id set. ARGV: id, lock, data, island ('' for none), island key prefix.
const STORE: &str = r"
local old = redis.call('HGET', KEYS[1], 'island')
if old and old ~= ARGV[4] then
  local old_key = ARGV[5] .. old
  if redis.call('GET', old_key) == ARGV[1] then redis.call('DEL', old_key) end
end
if ARGV[4] == '' then
  redis.call('HDEL', KEYS[1], 'island')
else
  redis.call('HSET', KEYS[1], 'island', ARGV[4])
  redis.call('SET', ARGV[5] .. ARGV[4], ARGV[1])
end
redis.call('HSET', KEYS[1], 'lock', ARGV[2], 'data', ARGV[3])
redis.call('SADD', KEYS[2], ARGV[1])
return 1
";

/// Updates `lock` only if the hash exists.
const SET_LOCK: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then redis.call('HSET', KEYS[1], 'lock', ARGV[1]) end
return 1
";

/// Key naming for one prefix.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Keys under `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Hash holding one player.
    #[must_use]
    pub fn player(&self, id: PlayerId) -> String {
        format!("{}player:{id}", self.prefix)
    }

    /// Set of all stored ids.
    #[must_use]
    pub fn ids(&self) -> String {
        format!("{}players", self.prefix)
    }

    /// Prefix of island index keys; the island id is appended.
    #[must_use]
    pub fn island_prefix(&self) -> String {
        format!("{}island:", self.prefix)
    }

    /// Island index key.
    #[must_use]
    pub fn island(&self, island_id: IslandId) -> String {
        format!("{}{island_id}", self.island_prefix())
    }
}

/// Redis-backed durable store.
pub struct RedisBackend {
    config: StorageConfig,
    keys: RedisKeys,
    policy: LockPolicy,
    clock: Arc<dyn Clock>,
    connector: ArcSwapOption<RedisConnector>,
    shared: Option<Arc<RedisConnector>>,
    fetch_lock: Script,
    store: Script,
    set_lock: Script,
}

impl RedisBackend {
    /// Creates a backend; the connection is opened by `initialize`.
    #[must_use]
    pub fn new(config: StorageConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: RedisKeys::new(config.prefix.clone()),
            policy: config.lock_policy(),
            config,
            clock,
            connector: ArcSwapOption::empty(),
            shared: None,
            fetch_lock: Script::new(FETCH_LOCK),
            store: Script::new(STORE),
            set_lock: Script::new(SET_LOCK),
        }
    }

    /// Creates a backend on a connection owned by someone else, typically the
    /// handoff channel. `close` leaves that connection open.
    #[must_use]
    pub fn with_connector(
        config: StorageConfig,
        clock: Arc<dyn Clock>,
        connector: Arc<RedisConnector>,
    ) -> Self {
        Self {
            shared: Some(connector),
            ..Self::new(config, clock)
        }
    }

    fn connector(&self) -> StorageResult<Arc<RedisConnector>> {
        self.connector
            .load_full()
            .ok_or(StorageError::NotReady(BackendKind::Redis))
    }

    fn io(err: impl Into<anyhow::Error>) -> StorageError {
        StorageError::io(BackendKind::Redis, err)
    }

    fn decode(id: PlayerId, data: &[u8]) -> StorageResult<PlayerRecord> {
        RecordCodec::decode(data).map_err(|e| {
            warn!(player = %id, error = %e, "unreadable redis record");
            StorageError::corrupt(id, e)
        })
    }

    async fn put(
        &self,
        connector: &RedisConnector,
        record: &PlayerRecord,
        lock: i64,
    ) -> StorageResult<()> {
        let id = record.id();
        let data = RecordCodec::encode(record).map_err(|e| StorageError::encode(id, e))?;
        let island = record.island_id.map(|i| i.to_string()).unwrap_or_default();
        let mut conn = connector.lease().await.map_err(Self::io)?;
        let _: i64 = self
            .store
            .key(self.keys.player(id))
            .key(self.keys.ids())
            .arg(id.to_string())
            .arg(lock)
            .arg(data)
            .arg(island)
            .arg(self.keys.island_prefix())
            .invoke_async(&mut *conn)
            .await
            .map_err(Self::io)?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        let connection = self.config.connection.as_ref().ok_or_else(|| StorageError::Config {
            kind: BackendKind::Redis,
            reason: "missing connection section".to_string(),
        })?;
        let connector = match &self.shared {
            Some(shared) => Arc::clone(shared),
            None => {
                let endpoint = RedisEndpoint::from_connection(connection);
                let pool_size = usize::try_from(self.config.pool.max_size).unwrap_or(1);
                Arc::new(RedisConnector::connect(endpoint, pool_size).await?)
            }
        };
        {
            let mut conn = connector.lease().await?;
            let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        }
        self.connector.store(Some(connector));
        info!(prefix = %self.config.prefix, shared = self.shared.is_some(), "redis backend ready");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.connector.load_full().is_some_and(|c| !c.is_closed())
    }

    async fn fetch(&self, id: PlayerId, lock: bool) -> StorageResult<FetchOutcome> {
        let connector = self.connector()?;
        let mut conn = connector.lease().await.map_err(Self::io)?;
        if !lock {
            let data: Option<Vec<u8>> = redis::cmd("HGET")
                .arg(self.keys.player(id))
                .arg("data")
                .query_async(&mut *conn)
                .await
                .map_err(Self::io)?;
            return match data {
                Some(data) => Ok(FetchOutcome::Available(Self::decode(id, &data)?)),
                None => Ok(FetchOutcome::Absent),
            };
        }

        let (state, data): (i64, Vec<u8>) = self
            .fetch_lock
            .key(self.keys.player(id))
            .arg(self.clock.now_secs())
            .arg(self.policy.ttl_secs())
            .invoke_async(&mut *conn)
            .await
            .map_err(Self::io)?;
        match state {
            0 => Ok(FetchOutcome::Absent),
            1 => Ok(FetchOutcome::Available(Self::decode(id, &data)?)),
            _ => Ok(FetchOutcome::Locked(Self::decode(id, &data)?)),
        }
    }

    async fn store(&self, record: &PlayerRecord, unlock: bool) -> StorageResult<()> {
        let connector = self.connector()?;
        let lock = LockPolicy::stamp_for_store(unlock, self.clock.now_secs());
        self.put(&connector, record, lock).await
    }

    async fn store_many(&self, records: &[PlayerRecord], unlock: bool) -> StorageResult<()> {
        let connector = self.connector()?;
        let lock = LockPolicy::stamp_for_store(unlock, self.clock.now_secs());
        let mut first_error = None;
        for record in records {
            if let Err(e) = self.put(&connector, record, lock).await {
                warn!(player = %record.id(), error = %e, "redis batch item failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn set_lock(&self, id: PlayerId, lock: bool) -> StorageResult<()> {
        let connector = self.connector()?;
        let mut conn = connector.lease().await.map_err(Self::io)?;
        let _: i64 = self
            .set_lock
            .key(self.keys.player(id))
            .arg(LockPolicy::stamp_for_store(!lock, self.clock.now_secs()))
            .invoke_async(&mut *conn)
            .await
            .map_err(Self::io)?;
        Ok(())
    }

    async fn enumerate_ids(&self) -> StorageResult<HashSet<PlayerId>> {
        let connector = self.connector()?;
        let mut conn = connector.lease().await.map_err(Self::io)?;
        let raw: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.ids())
            .query_async(&mut *conn)
            .await
            .map_err(Self::io)?;
        Ok(raw
            .into_iter()
            .filter_map(|s| match s.parse() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(id = %s, error = %e, "skipping malformed redis id");
                    None
                }
            })
            .collect())
    }

    async fn find_by_island(&self, island_id: IslandId) -> StorageResult<Option<PlayerId>> {
        let connector = self.connector()?;
        let mut conn = connector.lease().await.map_err(Self::io)?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.keys.island(island_id))
            .query_async(&mut *conn)
            .await
            .map_err(Self::io)?;
        raw.map(|s| {
            s.parse()
                .map_err(|e| Self::io(anyhow::anyhow!("malformed id {s:?} in island index: {e}")))
        })
        .transpose()
    }

    async fn close(&self) -> anyhow::Result<()> {
        if let Some(connector) = self.connector.swap(None) {
            if self.shared.is_none() {
                connector.close();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn key_layout() {
        let keys = RedisKeys::new("sky:");
        let id = Uuid::nil();
        assert_eq!(
            keys.player(id),
            "sky:player:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(keys.ids(), "sky:players");
        assert_eq!(keys.island(-4), "sky:island:-4");
    }

    #[tokio::test]
    async fn missing_connection_section_fails_initialize() {
        let backend = RedisBackend::new(
            StorageConfig::embedded(BackendKind::Redis, "unused"),
            Arc::new(skyhold_core::SystemClock),
        );
        let err = backend.initialize().await.unwrap_err();
        assert!(err.to_string().contains("missing connection section"));
        assert!(!backend.is_ready());
        assert!(matches!(
            backend.fetch(Uuid::new_v4(), true).await,
            Err(StorageError::NotReady(BackendKind::Redis))
        ));
    }
}
