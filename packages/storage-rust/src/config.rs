//! Configuration types for the storage subsystem.
//!
//! All structs deserialize with `#[serde(default)]`, so a host only has to
//! spell out the options it wants to change. Missing options fall back to
//! the defaults documented on each field.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skyhold_core::{LockPolicy, DEFAULT_LOCK_TTL_SECS};

/// Closed set of durable backends. Exactly one is active per manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One JSON file per player.
    Json,
    /// One YAML file per player.
    Yaml,
    /// Embedded `SQLite` database file.
    Sqlite,
    /// Embedded redb database file.
    Redb,
    /// Networked `MySQL` server.
    MySql,
    /// Networked `MariaDB` server (`MySQL` wire protocol).
    MariaDb,
    /// Networked `PostgreSQL` server.
    #[serde(rename = "postgresql", alias = "postgres")]
    Postgres,
    /// `MongoDB` document store.
    #[serde(rename = "mongodb", alias = "mongo")]
    MongoDb,
    /// Redis used as the durable key-value store.
    Redis,
    /// In-process memory only. Nothing survives a restart.
    #[serde(rename = "none", alias = "memory")]
    Memory,
}

impl BackendKind {
    /// Whether the backend talks to a server and needs a `connection` section.
    #[must_use]
    pub fn is_networked(self) -> bool {
        matches!(
            self,
            BackendKind::MySql
                | BackendKind::MariaDb
                | BackendKind::Postgres
                | BackendKind::MongoDb
                | BackendKind::Redis
        )
    }

    /// Whether `store_many` is all-or-nothing on this backend.
    #[must_use]
    pub fn is_transactional(self) -> bool {
        matches!(
            self,
            BackendKind::Sqlite
                | BackendKind::Redb
                | BackendKind::MySql
                | BackendKind::MariaDb
                | BackendKind::Postgres
        )
    }

    /// Port used when the connection section does not name one.
    #[must_use]
    pub fn default_port(self) -> Option<u16> {
        match self {
            BackendKind::MySql | BackendKind::MariaDb => Some(3306),
            BackendKind::Postgres => Some(5432),
            BackendKind::MongoDb => Some(27017),
            BackendKind::Redis => Some(6379),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Json => "json",
            BackendKind::Yaml => "yaml",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Redb => "redb",
            BackendKind::MySql => "mysql",
            BackendKind::MariaDb => "mariadb",
            BackendKind::Postgres => "postgresql",
            BackendKind::MongoDb => "mongodb",
            BackendKind::Redis => "redis",
            BackendKind::Memory => "none",
        };
        f.write_str(name)
    }
}

/// Durable backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Selected backend.
    pub backend: BackendKind,
    /// Server coordinates. Required by networked backends.
    pub connection: Option<ConnectionConfig>,
    /// Root directory for embedded backends.
    pub data_dir: PathBuf,
    /// Prefix applied to every table, collection, key and file created.
    pub prefix: String,
    /// Compress file-backend documents with zstd.
    pub compress: bool,
    /// Connection pool sizing for pooled backends.
    pub pool: PoolConfig,
    /// Seconds a lock stamp is honored before it is considered stale.
    pub lock_ttl_secs: u64,
    /// Island lookup cache used by backends without a native secondary index.
    pub index_cache: IndexCacheConfig,
}

impl StorageConfig {
    /// Lock policy derived from `lock_ttl_secs`.
    #[must_use]
    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy::new(Duration::from_secs(self.lock_ttl_secs))
    }

    /// Returns a copy configured for `backend` rooted at `data_dir`.
    #[must_use]
    pub fn embedded(backend: BackendKind, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Json,
            connection: None,
            data_dir: PathBuf::from("database"),
            prefix: String::new(),
            compress: false,
            pool: PoolConfig::default(),
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS.unsigned_abs(),
            index_cache: IndexCacheConfig::default(),
        }
    }
}

/// Coordinates of a database server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server host name.
    pub host: String,
    /// Server port. `None` selects the backend's well-known port.
    pub port: Option<u16>,
    /// Database (or Redis logical DB number as a string).
    pub database: String,
    /// Login user. Empty means no credentials.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Require TLS on the connection.
    pub use_tls: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            database: "skyhold".to_string(),
            username: String::new(),
            password: String::new(),
            use_tls: false,
        }
    }
}

/// Percent-encodes a URL userinfo component (user name or password).
pub(crate) fn encode_userinfo(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Connection pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum open connections.
    pub max_size: u32,
    /// Connections kept open while idle.
    pub min_idle: u32,
    /// Maximum lifetime of a pooled connection in milliseconds.
    pub max_lifetime_ms: u64,
    /// Idle connections above `min_idle` are closed after this many milliseconds.
    pub idle_timeout_ms: u64,
    /// Maximum wait for a connection before the operation fails, in milliseconds.
    pub connection_timeout_ms: u64,
}

impl PoolConfig {
    /// `max_lifetime_ms` as a `Duration`.
    #[must_use]
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    /// `idle_timeout_ms` as a `Duration`.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// `connection_timeout_ms` as a `Duration`.
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: 2,
            max_lifetime_ms: 1_800_000,
            idle_timeout_ms: 600_000,
            connection_timeout_ms: 5_000,
        }
    }
}

/// Bounds for the island-to-player lookup cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexCacheConfig {
    /// Maximum number of cached mappings.
    pub capacity: usize,
    /// Seconds after which a cached mapping is re-resolved.
    pub max_age_secs: u64,
}

impl IndexCacheConfig {
    /// `max_age_secs` as a `Duration`.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Default for IndexCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_age_secs: 600,
        }
    }
}

/// Cross-process handoff channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Enable the channel. When disabled, activation goes straight to the backend.
    pub enabled: bool,
    /// Redis host.
    pub host: String,
    /// Redis port.
    pub port: u16,
    /// Redis password. Empty means no AUTH.
    pub password: String,
    /// Connect with TLS (`rediss://`).
    pub use_tls: bool,
    /// Maximum concurrent commands in flight on the shared connection.
    pub pool_size: usize,
    /// Processes sharing one player population. Scopes keys and control messages.
    pub server_group: String,
    /// Seconds a handoff token and payload live before expiring.
    pub token_ttl_secs: u64,
}

impl HandoffConfig {
    /// `token_ttl_secs` as a `Duration`.
    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 6379,
            password: String::new(),
            use_tls: false,
            pool_size: 8,
            server_group: "default".to_string(),
            token_ttl_secs: 10,
        }
    }
}

/// Orchestration policy for the storage manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Identifier of this process within the server group.
    pub node_id: String,
    /// Backend fetches attempted while a record is locked elsewhere.
    pub lock_retry_attempts: u32,
    /// Wait between lock-contention retries, in milliseconds.
    pub lock_retry_interval_ms: u64,
    /// Handoff payload polls before falling back to the backend.
    pub handoff_poll_attempts: u32,
    /// Wait between handoff polls, in milliseconds.
    pub handoff_poll_interval_ms: u64,
    /// Seconds between batch flushes of online records. 0 disables the flusher.
    pub flush_interval_secs: u64,
}

impl ManagerConfig {
    /// `lock_retry_interval_ms` as a `Duration`.
    #[must_use]
    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    /// `handoff_poll_interval_ms` as a `Duration`.
    #[must_use]
    pub fn handoff_poll_interval(&self) -> Duration {
        Duration::from_millis(self.handoff_poll_interval_ms)
    }

    /// Flush interval, or `None` when the flusher is disabled.
    #[must_use]
    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_interval_secs > 0).then(|| Duration::from_secs(self.flush_interval_secs))
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            lock_retry_attempts: 3,
            lock_retry_interval_ms: 1_000,
            handoff_poll_attempts: 6,
            handoff_poll_interval_ms: 333,
            flush_interval_secs: 0,
        }
    }
}

/// Everything the subsystem reads, as one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkyholdConfig {
    /// Durable backend selection and settings.
    pub storage: StorageConfig,
    /// Cross-process handoff channel.
    pub handoff: HandoffConfig,
    /// Manager policy.
    pub manager: ManagerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.backend, BackendKind::Json);
        assert!(config.connection.is_none());
        assert_eq!(config.lock_ttl_secs, 30);
        assert_eq!(config.lock_policy().ttl_secs(), 30);
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.pool.connection_timeout(), Duration::from_secs(5));
        assert_eq!(config.pool.idle_timeout(), Duration::from_secs(600));
        assert!(config.pool.idle_timeout() < config.pool.max_lifetime());
    }

    #[test]
    fn manager_config_defaults_match_reference_policy() {
        let config = ManagerConfig::default();
        assert_eq!(config.lock_retry_attempts, 3);
        assert_eq!(config.lock_retry_interval(), Duration::from_secs(1));
        assert_eq!(config.handoff_poll_attempts, 6);
        assert_eq!(config.handoff_poll_interval(), Duration::from_millis(333));
        assert!(config.flush_interval().is_none());
    }

    #[test]
    fn handoff_config_defaults() {
        let config = HandoffConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.port, 6379);
        assert_eq!(config.token_ttl(), Duration::from_secs(10));
    }

    #[test]
    fn partial_document_fills_defaults() {
        let config: SkyholdConfig = serde_json::from_str(
            r#"{
                "storage": {
                    "backend": "postgresql",
                    "prefix": "sky_",
                    "connection": { "host": "db.internal", "username": "sky" }
                },
                "manager": { "flush_interval_secs": 300 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.storage.backend, BackendKind::Postgres);
        assert_eq!(config.storage.prefix, "sky_");
        let connection = config.storage.connection.unwrap();
        assert_eq!(connection.host, "db.internal");
        assert!(connection.port.is_none());
        assert_eq!(connection.database, "skyhold");
        assert_eq!(config.manager.flush_interval(), Some(Duration::from_secs(300)));
        assert_eq!(config.manager.lock_retry_attempts, 3);
        assert!(!config.handoff.enabled);
    }

    #[test]
    fn backend_aliases_deserialize() {
        let kind: BackendKind = serde_json::from_str("\"postgres\"").unwrap();
        assert_eq!(kind, BackendKind::Postgres);
        let kind: BackendKind = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(kind, BackendKind::Memory);
        let kind: BackendKind = serde_json::from_str("\"mariadb\"").unwrap();
        assert_eq!(kind, BackendKind::MariaDb);
    }

    #[test]
    fn backend_traits() {
        assert!(BackendKind::Postgres.is_networked());
        assert!(!BackendKind::Sqlite.is_networked());
        assert!(BackendKind::Redb.is_transactional());
        assert!(!BackendKind::MongoDb.is_transactional());
        assert_eq!(BackendKind::MariaDb.default_port(), Some(3306));
        assert_eq!(BackendKind::Json.default_port(), None);
        assert_eq!(BackendKind::Postgres.to_string(), "postgresql");
    }
}
