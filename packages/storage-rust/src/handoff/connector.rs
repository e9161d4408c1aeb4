//! Shared Redis connection lifecycle.
//!
//! One [`RedisConnector`] owns the client and a multiplexed
//! [`ConnectionManager`]; every caller (handoff keys, control pub/sub, the
//! Redis storage backend) goes through it. A semaphore bounds the number of
//! commands in flight, standing in for a pool size.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use anyhow::Context;
use redis::aio::{ConnectionManager, PubSub};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::info;

use crate::config::{encode_userinfo, BackendKind, ConnectionConfig, HandoffConfig};

/// Where and how to reach a Redis server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisEndpoint {
    /// Host name.
    pub host: String,
    /// Port.
    pub port: u16,
    /// AUTH password. Empty means none.
    pub password: String,
    /// Use `rediss://`.
    pub use_tls: bool,
    /// Logical database number.
    pub db: i64,
}

impl RedisEndpoint {
    /// Endpoint for the handoff channel.
    #[must_use]
    pub fn from_handoff(config: &HandoffConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            password: config.password.clone(),
            use_tls: config.use_tls,
            db: 0,
        }
    }

    /// Endpoint for the Redis storage backend. A numeric `database` selects
    /// the logical DB, anything else uses DB 0.
    #[must_use]
    pub fn from_connection(config: &ConnectionConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config
                .port
                .or_else(|| BackendKind::Redis.default_port())
                .unwrap_or(6379),
            password: config.password.clone(),
            use_tls: config.use_tls,
            db: config.database.parse().unwrap_or(0),
        }
    }

    /// Connection URL understood by the `redis` crate.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.use_tls { "rediss" } else { "redis" };
        let auth = if self.password.is_empty() {
            String::new()
        } else {
            format!(":{}@", encode_userinfo(&self.password))
        };
        format!("{scheme}://{auth}{}:{}/{}", self.host, self.port, self.db)
    }
}

/// Owner of the shared Redis connection.
pub struct RedisConnector {
    client: redis::Client,
    manager: ConnectionManager,
    permits: Arc<Semaphore>,
    endpoint: RedisEndpoint,
}

impl RedisConnector {
    /// Opens the client and the multiplexed connection.
    ///
    /// # Errors
    ///
    /// Fails if the URL is invalid or the server is unreachable.
    pub async fn connect(endpoint: RedisEndpoint, pool_size: usize) -> anyhow::Result<Self> {
        let client = redis::Client::open(endpoint.url()).context("invalid redis endpoint")?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .with_context(|| format!("cannot reach redis at {}:{}", endpoint.host, endpoint.port))?;
        info!(host = %endpoint.host, port = endpoint.port, tls = endpoint.use_tls, "redis connected");
        Ok(Self {
            client,
            manager,
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            endpoint,
        })
    }

    /// Endpoint this connector talks to.
    #[must_use]
    pub fn endpoint(&self) -> &RedisEndpoint {
        &self.endpoint
    }

    /// Borrows the connection for one command or script.
    ///
    /// # Errors
    ///
    /// Fails once the connector has been closed.
    pub async fn lease(&self) -> anyhow::Result<RedisLease<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .context("redis connector is closed")?;
        Ok(RedisLease {
            _permit: permit,
            conn: self.manager.clone(),
        })
    }

    /// Opens a dedicated pub/sub connection.
    ///
    /// # Errors
    ///
    /// Fails if the server is unreachable.
    pub async fn pubsub(&self) -> anyhow::Result<PubSub> {
        self.client
            .get_async_pubsub()
            .await
            .context("cannot open redis pub/sub connection")
    }

    /// Refuses further leases. In-flight leases finish normally.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

/// A connection handle counted against the connector's concurrency limit.
pub struct RedisLease<'a> {
    _permit: SemaphorePermit<'a>,
    conn: ConnectionManager,
}

impl Deref for RedisLease<'_> {
    type Target = ConnectionManager;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for RedisLease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handoff_endpoint_url() {
        let mut config = HandoffConfig::default();
        assert_eq!(
            RedisEndpoint::from_handoff(&config).url(),
            "redis://localhost:6379/0"
        );

        config.password = "s3cr:t".to_string();
        config.use_tls = true;
        config.host = "cache.internal".to_string();
        assert_eq!(
            RedisEndpoint::from_handoff(&config).url(),
            "rediss://:s3cr%3At@cache.internal:6379/0"
        );
    }

    #[test]
    fn connection_endpoint_selects_database() {
        let config = ConnectionConfig {
            database: "3".to_string(),
            port: Some(6380),
            ..ConnectionConfig::default()
        };
        let endpoint = RedisEndpoint::from_connection(&config);
        assert_eq!(endpoint.db, 3);
        assert_eq!(endpoint.url(), "redis://localhost:6380/3");

        let named = RedisEndpoint::from_connection(&ConnectionConfig::default());
        assert_eq!(named.db, 0);
        assert_eq!(named.port, 6379);
    }
}
