//! Construction of the configured [`StorageBackend`].
//!
//! [`BackendFactory`] is the single place that maps a [`BackendKind`] to a
//! concrete implementation. The manager receives the result as
//! `Arc<dyn StorageBackend>` and never names a concrete type.

use std::sync::Arc;

use skyhold_core::{Clock, SystemClock};
use tracing::warn;

use crate::config::{BackendKind, StorageConfig};
use crate::error::StorageResult;
use crate::storage::backend::StorageBackend;
#[cfg(feature = "redis")]
use crate::handoff::{RedisConnector, RedisEndpoint};
use crate::storage::backends::{DisabledBackend, JsonFileBackend, MemoryBackend, YamlFileBackend};
#[cfg(feature = "redis")]
use crate::storage::backends::RedisBackend;

/// Builds backends from configuration with a shared clock.
pub struct BackendFactory {
    clock: Arc<dyn Clock>,
}

impl BackendFactory {
    /// Factory using the given clock for lock stamps.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Factory stamping locks with the system clock.
    #[must_use]
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Creates the backend selected by `config.backend`. The result is not
    /// initialized yet.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`](crate::error::StorageError::Config)
    /// when the configuration is structurally invalid for the selected kind.
    pub fn create(&self, config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
        let clock = Arc::clone(&self.clock);
        let backend: Arc<dyn StorageBackend> = match config.backend {
            BackendKind::Json => Arc::new(JsonFileBackend::new(config, clock)),
            BackendKind::Yaml => Arc::new(YamlFileBackend::new(config, clock)),
            BackendKind::Memory => Arc::new(MemoryBackend::new(config.lock_policy(), clock)),
            BackendKind::Sqlite => Self::sql(config, clock, cfg!(feature = "sqlite"))?,
            BackendKind::MySql | BackendKind::MariaDb => {
                Self::sql(config, clock, cfg!(feature = "mysql"))?
            }
            BackendKind::Postgres => Self::sql(config, clock, cfg!(feature = "postgres"))?,
            BackendKind::Redb => Self::redb(config, clock),
            BackendKind::Redis => Self::redis(config, clock),
            BackendKind::MongoDb => Self::mongo(config, clock),
        };
        Ok(backend)
    }

    /// Creates the backend and initializes it. Initialization failures are
    /// logged and leave the backend not ready; they are not returned.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Self::create).
    pub async fn create_initialized(
        &self,
        config: &StorageConfig,
    ) -> StorageResult<Arc<dyn StorageBackend>> {
        let backend = self.create(config)?;
        if let Err(e) = backend.initialize().await {
            warn!(backend = %config.backend, error = %e, "backend failed to initialize");
        }
        Ok(backend)
    }

    /// Like [`create_initialized`](Self::create_initialized), except that a
    /// Redis backend on the same server as `connector` reuses it instead of
    /// opening a second connection.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Self::create).
    #[cfg(feature = "redis")]
    pub async fn create_initialized_sharing(
        &self,
        config: &StorageConfig,
        connector: &Arc<RedisConnector>,
    ) -> StorageResult<Arc<dyn StorageBackend>> {
        if !Self::shares_redis(config, connector.endpoint()) {
            return self.create_initialized(config).await;
        }
        let backend: Arc<dyn StorageBackend> = Arc::new(RedisBackend::with_connector(
            config.clone(),
            Arc::clone(&self.clock),
            Arc::clone(connector),
        ));
        if let Err(e) = backend.initialize().await {
            warn!(backend = %config.backend, error = %e, "backend failed to initialize");
        }
        Ok(backend)
    }

    /// Whether `config` selects a Redis backend reachable through `endpoint`.
    #[cfg(feature = "redis")]
    #[must_use]
    pub fn shares_redis(config: &StorageConfig, endpoint: &RedisEndpoint) -> bool {
        config.backend == BackendKind::Redis
            && config
                .connection
                .as_ref()
                .is_some_and(|c| RedisEndpoint::from_connection(c) == *endpoint)
    }

    fn disabled(kind: BackendKind) -> Arc<dyn StorageBackend> {
        warn!(backend = %kind, "backend driver not compiled in");
        Arc::new(DisabledBackend::new(kind))
    }

    #[cfg(any(feature = "sqlite", feature = "mysql", feature = "postgres"))]
    fn sql(
        config: &StorageConfig,
        clock: Arc<dyn Clock>,
        compiled: bool,
    ) -> StorageResult<Arc<dyn StorageBackend>> {
        if !compiled {
            return Ok(Self::disabled(config.backend));
        }
        let backend = crate::storage::backends::SqlBackend::new(config.clone(), clock)?;
        Ok(Arc::new(backend))
    }

    #[cfg(not(any(feature = "sqlite", feature = "mysql", feature = "postgres")))]
    fn sql(
        config: &StorageConfig,
        _clock: Arc<dyn Clock>,
        _compiled: bool,
    ) -> StorageResult<Arc<dyn StorageBackend>> {
        Ok(Self::disabled(config.backend))
    }

    #[cfg(feature = "redb")]
    fn redb(config: &StorageConfig, clock: Arc<dyn Clock>) -> Arc<dyn StorageBackend> {
        Arc::new(crate::storage::backends::RedbBackend::new(config, clock))
    }

    #[cfg(not(feature = "redb"))]
    fn redb(config: &StorageConfig, _clock: Arc<dyn Clock>) -> Arc<dyn StorageBackend> {
        Self::disabled(config.backend)
    }

    #[cfg(feature = "redis")]
    fn redis(config: &StorageConfig, clock: Arc<dyn Clock>) -> Arc<dyn StorageBackend> {
        Arc::new(RedisBackend::new(config.clone(), clock))
    }

    #[cfg(not(feature = "redis"))]
    fn redis(config: &StorageConfig, _clock: Arc<dyn Clock>) -> Arc<dyn StorageBackend> {
        Self::disabled(config.backend)
    }

    #[cfg(feature = "mongodb")]
    fn mongo(config: &StorageConfig, clock: Arc<dyn Clock>) -> Arc<dyn StorageBackend> {
        Arc::new(crate::storage::backends::MongoBackend::new(config.clone(), clock))
    }

    #[cfg(not(feature = "mongodb"))]
    fn mongo(config: &StorageConfig, _clock: Arc<dyn Clock>) -> Arc<dyn StorageBackend> {
        Self::disabled(config.backend)
    }
}

impl Default for BackendFactory {
    fn default() -> Self {
        Self::system()
    }
}
