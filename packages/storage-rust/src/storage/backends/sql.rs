//! Relational backends over a pooled `sqlx` [`AnyPool`].
//!
//! One table per deployment, `{prefix}players`:
//!
//! | column      | type                          |
//! |-------------|-------------------------------|
//! | `id`        | `VARCHAR(36)` primary key     |
//! | `island_id` | `BIGINT NULL`, indexed        |
//! | `lock_ts`   | `BIGINT NOT NULL DEFAULT 0`   |
//! | `data`      | encoded record blob           |
//!
//! Lock acquisition is a single conditional `UPDATE`, so two processes racing
//! on one row cannot both win. `store_many` runs in one transaction.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use skyhold_core::{Clock, FetchOutcome, IslandId, LockPolicy, PlayerId, PlayerRecord, RecordCodec};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use sqlx::Row;
use tracing::{debug, error, info, warn};

use crate::config::{encode_userinfo, BackendKind, ConnectionConfig, PoolConfig, StorageConfig};
use crate::error::{StorageError, StorageResult};
use crate::storage::backend::StorageBackend;

/// SQL dialect spoken by the configured server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// Embedded `SQLite` file.
    Sqlite,
    /// `MySQL` or `MariaDB`.
    MySql,
    /// `PostgreSQL`.
    Postgres,
}

impl SqlDialect {
    /// Dialect for a backend kind, or `None` for non-relational kinds.
    #[must_use]
    pub fn for_kind(kind: BackendKind) -> Option<Self> {
        match kind {
            BackendKind::Sqlite => Some(SqlDialect::Sqlite),
            BackendKind::MySql | BackendKind::MariaDb => Some(SqlDialect::MySql),
            BackendKind::Postgres => Some(SqlDialect::Postgres),
            _ => None,
        }
    }

    /// Positional bind marker for the `n`th parameter (1-based).
    fn param(self, n: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${n}"),
            SqlDialect::Sqlite | SqlDialect::MySql => "?".to_string(),
        }
    }

    fn blob_type(self) -> &'static str {
        match self {
            SqlDialect::Sqlite => "BLOB",
            SqlDialect::MySql => "LONGBLOB",
            SqlDialect::Postgres => "BYTEA",
        }
    }
}

/// Prepared statement text for one table in one dialect.
#[derive(Debug, Clone)]
pub struct SqlStatements {
    /// Schema bootstrap, executed in order.
    pub ddl: Vec<String>,
    /// Conditional lock acquisition: `(now, id, stale_before)`.
    pub acquire: String,
    /// Row read: `(id)`.
    pub select: String,
    /// Upsert: `(id, island_id, lock_ts, data)`.
    pub upsert: String,
    /// Lock-only update: `(lock_ts, id)`.
    pub set_lock: String,
    /// Identifier scan.
    pub enumerate: String,
    /// Secondary index lookup: `(island_id)`.
    pub find_island: String,
}

impl SqlStatements {
    /// Builds the statements for `table` in `dialect`.
    #[must_use]
    pub fn new(dialect: SqlDialect, table: &str) -> Self {
        let p = |n| dialect.param(n);
        let blob = dialect.blob_type();

        let ddl = match dialect {
            SqlDialect::MySql => vec![format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id VARCHAR(36) NOT NULL PRIMARY KEY, \
                 island_id BIGINT NULL, \
                 lock_ts BIGINT NOT NULL DEFAULT 0, \
                 data {blob} NOT NULL, \
                 INDEX {table}_island (island_id))"
            )],
            SqlDialect::Sqlite | SqlDialect::Postgres => vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {table} (\
                     id VARCHAR(36) NOT NULL PRIMARY KEY, \
                     island_id BIGINT NULL, \
                     lock_ts BIGINT NOT NULL DEFAULT 0, \
                     data {blob} NOT NULL)"
                ),
                format!("CREATE INDEX IF NOT EXISTS {table}_island ON {table} (island_id)"),
            ],
        };

        let upsert_tail = match dialect {
            SqlDialect::MySql => "ON DUPLICATE KEY UPDATE island_id = VALUES(island_id), \
                                  lock_ts = VALUES(lock_ts), data = VALUES(data)"
                .to_string(),
            SqlDialect::Sqlite | SqlDialect::Postgres => {
                "ON CONFLICT (id) DO UPDATE SET island_id = excluded.island_id, \
                 lock_ts = excluded.lock_ts, data = excluded.data"
                    .to_string()
            }
        };

        Self {
            ddl,
            acquire: format!(
                "UPDATE {table} SET lock_ts = {} WHERE id = {} AND (lock_ts = 0 OR lock_ts < {})",
                p(1),
                p(2),
                p(3)
            ),
            select: format!("SELECT lock_ts, data FROM {table} WHERE id = {}", p(1)),
            upsert: format!(
                "INSERT INTO {table} (id, island_id, lock_ts, data) VALUES ({}, {}, {}, {}) {upsert_tail}",
                p(1),
                p(2),
                p(3),
                p(4)
            ),
            set_lock: format!("UPDATE {table} SET lock_ts = {} WHERE id = {}", p(1), p(2)),
            enumerate: format!("SELECT id FROM {table}"),
            find_island: format!(
                "SELECT id FROM {table} WHERE island_id = {} LIMIT 1",
                p(1)
            ),
        }
    }
}

/// Rejects prefixes that are not plain SQL identifiers.
fn validate_prefix(kind: BackendKind, prefix: &str) -> StorageResult<()> {
    if prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StorageError::Config {
            kind,
            reason: format!("prefix {prefix:?} must contain only [A-Za-z0-9_]"),
        })
    }
}

fn server_url(scheme: &str, kind: BackendKind, conn: &ConnectionConfig) -> String {
    let credentials = if conn.username.is_empty() {
        String::new()
    } else if conn.password.is_empty() {
        format!("{}@", encode_userinfo(&conn.username))
    } else {
        format!(
            "{}:{}@",
            encode_userinfo(&conn.username),
            encode_userinfo(&conn.password)
        )
    };
    let port = conn.port.or_else(|| kind.default_port()).unwrap_or_default();
    format!(
        "{scheme}://{credentials}{}:{port}/{}",
        conn.host, conn.database
    )
}

/// Builds the connection URL for a relational backend.
///
/// # Errors
///
/// Returns [`StorageError::Config`] when a server backend has no connection section.
pub fn connection_url(config: &StorageConfig) -> StorageResult<String> {
    let kind = config.backend;
    let missing = || StorageError::Config {
        kind,
        reason: "missing connection section".to_string(),
    };
    match SqlDialect::for_kind(kind) {
        Some(SqlDialect::Sqlite) => Ok(format!(
            "sqlite://{}?mode=rwc",
            config
                .data_dir
                .join(format!("{}skyhold.db", config.prefix))
                .display()
        )),
        Some(SqlDialect::MySql) => {
            let conn = config.connection.as_ref().ok_or_else(missing)?;
            let mut url = server_url("mysql", kind, conn);
            if conn.use_tls {
                url.push_str("?ssl-mode=required");
            }
            Ok(url)
        }
        Some(SqlDialect::Postgres) => {
            let conn = config.connection.as_ref().ok_or_else(missing)?;
            let mut url = server_url("postgres", kind, conn);
            if conn.use_tls {
                url.push_str("?sslmode=require");
            }
            Ok(url)
        }
        None => Err(StorageError::Config {
            kind,
            reason: "not a relational backend".to_string(),
        }),
    }
}

/// Pooled relational backend.
pub struct SqlBackend {
    config: StorageConfig,
    dialect: SqlDialect,
    statements: SqlStatements,
    policy: LockPolicy,
    clock: Arc<dyn Clock>,
    pool: ArcSwapOption<AnyPool>,
}

impl SqlBackend {
    /// Creates a backend for a relational `config.backend`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] if the kind is not relational or the
    /// prefix is not a valid identifier.
    pub fn new(config: StorageConfig, clock: Arc<dyn Clock>) -> StorageResult<Self> {
        let kind = config.backend;
        let dialect = SqlDialect::for_kind(kind).ok_or_else(|| StorageError::Config {
            kind,
            reason: "not a relational backend".to_string(),
        })?;
        validate_prefix(kind, &config.prefix)?;
        let statements = SqlStatements::new(dialect, &format!("{}players", config.prefix));
        Ok(Self {
            policy: config.lock_policy(),
            config,
            dialect,
            statements,
            clock,
            pool: ArcSwapOption::empty(),
        })
    }

    /// Statement text in use.
    #[must_use]
    pub fn statements(&self) -> &SqlStatements {
        &self.statements
    }

    fn pool(&self) -> StorageResult<Arc<AnyPool>> {
        self.pool
            .load_full()
            .ok_or(StorageError::NotReady(self.config.backend))
    }

    fn io(&self, err: impl Into<anyhow::Error>) -> StorageError {
        StorageError::io(self.config.backend, err)
    }

    fn pool_options(pool: &PoolConfig) -> AnyPoolOptions {
        AnyPoolOptions::new()
            .max_connections(pool.max_size.max(1))
            .min_connections(pool.min_idle.min(pool.max_size))
            .max_lifetime(pool.max_lifetime())
            .idle_timeout(pool.idle_timeout())
            .acquire_timeout(pool.connection_timeout())
    }

    fn encode(record: &PlayerRecord) -> StorageResult<Vec<u8>> {
        RecordCodec::encode(record).map_err(|e| StorageError::encode(record.id(), e))
    }

    fn decode(&self, id: PlayerId, data: &[u8]) -> StorageResult<PlayerRecord> {
        RecordCodec::decode(data).map_err(|e| {
            warn!(player = %id, backend = %self.kind(), error = %e, "unreadable player row");
            StorageError::corrupt(id, e)
        })
    }

    /// Runs one upsert against any executor (pool or open transaction).
    async fn upsert<'e, E>(
        &self,
        executor: E,
        record: &PlayerRecord,
        lock: i64,
        data: Vec<u8>,
    ) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Any>,
    {
        sqlx::query(&self.statements.upsert)
            .bind(record.id().to_string())
            .bind(record.island_id)
            .bind(lock)
            .bind(data)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Reads `(lock_ts, data)` for a row.
    async fn select(&self, pool: &AnyPool, id: PlayerId) -> StorageResult<Option<(i64, Vec<u8>)>> {
        let row = sqlx::query(&self.statements.select)
            .bind(id.to_string())
            .fetch_optional(pool)
            .await
            .map_err(|e| self.io(e))?;
        row.map(|row| -> Result<_, sqlx::Error> {
            Ok((row.try_get::<i64, _>("lock_ts")?, row.try_get::<Vec<u8>, _>("data")?))
        })
        .transpose()
        .map_err(|e| self.io(e))
    }
}

#[async_trait]
impl StorageBackend for SqlBackend {
    fn kind(&self) -> BackendKind {
        self.config.backend
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::any::install_default_drivers();
        let kind = self.kind();
        if self.dialect == SqlDialect::Sqlite {
            tokio::fs::create_dir_all(&self.config.data_dir)
                .await
                .with_context(|| format!("cannot create {}", self.config.data_dir.display()))?;
        }
        let url = connection_url(&self.config).inspect_err(|e| {
            error!(backend = %kind, error = %e, "backend configuration rejected");
        })?;

        let pool = Self::pool_options(&self.config.pool)
            .connect(&url)
            .await
            .with_context(|| format!("{kind} connection failed"))?;

        for statement in &self.statements.ddl {
            if let Err(e) = sqlx::query(statement).execute(&pool).await {
                error!(backend = %kind, error = %e, "schema bootstrap failed");
                pool.close().await;
                return Err(anyhow::Error::new(e).context(format!("{kind} schema bootstrap failed")));
            }
        }

        self.pool.store(Some(Arc::new(pool)));
        info!(backend = %kind, "relational backend ready");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.pool.load_full().is_some_and(|p| !p.is_closed())
    }

    async fn fetch(&self, id: PlayerId, lock: bool) -> StorageResult<FetchOutcome> {
        let pool = self.pool()?;
        let acquired = if lock {
            let now = self.clock.now_secs();
            let result = sqlx::query(&self.statements.acquire)
                .bind(now)
                .bind(id.to_string())
                .bind(self.policy.stale_before(now))
                .execute(pool.as_ref())
                .await
                .map_err(|e| self.io(e))?;
            result.rows_affected() == 1
        } else {
            true
        };

        let Some((_, data)) = self.select(&pool, id).await? else {
            return Ok(FetchOutcome::Absent);
        };
        let record = match self.decode(id, &data) {
            Ok(record) => record,
            Err(e) => {
                if lock && acquired {
                    // Do not leave the owner's next attempt facing our stamp.
                    if let Err(release) = self.set_lock(id, false).await {
                        warn!(player = %id, error = %release, "releasing lock on unreadable row failed");
                    }
                }
                return Err(e);
            }
        };
        if acquired {
            Ok(FetchOutcome::Available(record))
        } else {
            debug!(player = %id, backend = %self.kind(), "row is locked by another holder");
            Ok(FetchOutcome::Locked(record))
        }
    }

    async fn store(&self, record: &PlayerRecord, unlock: bool) -> StorageResult<()> {
        let pool = self.pool()?;
        let data = Self::encode(record)?;
        let lock = LockPolicy::stamp_for_store(unlock, self.clock.now_secs());
        self.upsert(pool.as_ref(), record, lock, data)
            .await
            .map_err(|e| self.io(e))
    }

    async fn store_many(&self, records: &[PlayerRecord], unlock: bool) -> StorageResult<()> {
        let pool = self.pool()?;
        if records.is_empty() {
            return Ok(());
        }
        let encoded = records
            .iter()
            .map(|r| Self::encode(r).map(|data| (r, data)))
            .collect::<StorageResult<Vec<_>>>()?;
        let lock = LockPolicy::stamp_for_store(unlock, self.clock.now_secs());
        let count = records.len();
        let rolled_back = |source: sqlx::Error| StorageError::BatchRolledBack {
            count,
            source: source.into(),
        };

        let mut tx = pool.begin().await.map_err(|e| self.io(e))?;
        for (record, data) in encoded {
            // Dropping `tx` on the error path rolls the whole batch back.
            self.upsert(&mut *tx, record, lock, data)
                .await
                .map_err(rolled_back)?;
        }
        tx.commit().await.map_err(rolled_back)
    }

    async fn set_lock(&self, id: PlayerId, lock: bool) -> StorageResult<()> {
        let pool = self.pool()?;
        sqlx::query(&self.statements.set_lock)
            .bind(LockPolicy::stamp_for_store(!lock, self.clock.now_secs()))
            .bind(id.to_string())
            .execute(pool.as_ref())
            .await
            .map_err(|e| self.io(e))?;
        Ok(())
    }

    async fn enumerate_ids(&self) -> StorageResult<HashSet<PlayerId>> {
        let pool = self.pool()?;
        let rows = sqlx::query(&self.statements.enumerate)
            .fetch_all(pool.as_ref())
            .await
            .map_err(|e| self.io(e))?;
        let mut ids = HashSet::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("id").map_err(|e| self.io(e))?;
            match raw.parse() {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(e) => warn!(backend = %self.kind(), id = %raw, error = %e, "skipping malformed id"),
            }
        }
        Ok(ids)
    }

    async fn find_by_island(&self, island_id: IslandId) -> StorageResult<Option<PlayerId>> {
        let pool = self.pool()?;
        let row = sqlx::query(&self.statements.find_island)
            .bind(island_id)
            .fetch_optional(pool.as_ref())
            .await
            .map_err(|e| self.io(e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.try_get("id").map_err(|e| self.io(e))?;
        raw.parse()
            .map(Some)
            .map_err(|e| self.io(anyhow::anyhow!("malformed id {raw:?}: {e}")))
    }

    async fn close(&self) -> anyhow::Result<()> {
        if let Some(pool) = self.pool.swap(None) {
            pool.close().await;
            debug!(backend = %self.kind(), "relational pool closed");
        }
        Ok(())
    }
}
