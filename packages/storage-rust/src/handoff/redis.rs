//! Redis-backed [`HandoffChannel`].
//!
//! Keys, scoped by server group:
//! - `{group}:handoff:{uuid}`: transfer-pending token (`SET .. EX ttl`)
//! - `{group}:handoff-data:{uuid}`: payload, consumed with `GETDEL`
//!
//! Control messages travel on the `{group}:control` pub/sub channel. A
//! background task forwards them to local subscribers.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use skyhold_core::PlayerId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HandoffConfig;
use crate::handoff::channel::{HandoffChannel, Subscribers};
use crate::handoff::connector::{RedisConnector, RedisEndpoint};
use crate::handoff::message::ControlMessage;

/// Key naming for one server group.
#[derive(Debug, Clone)]
pub struct HandoffKeys {
    group: String,
}

impl HandoffKeys {
    /// Keys for `server_group`.
    #[must_use]
    pub fn new(server_group: impl Into<String>) -> Self {
        Self {
            group: server_group.into(),
        }
    }

    /// Transfer-pending token.
    #[must_use]
    pub fn token(&self, id: PlayerId) -> String {
        format!("{}:handoff:{id}", self.group)
    }

    /// Transferred payload.
    #[must_use]
    pub fn payload(&self, id: PlayerId) -> String {
        format!("{}:handoff-data:{id}", self.group)
    }

    /// Pub/sub channel for control messages.
    #[must_use]
    pub fn control(&self) -> String {
        format!("{}:control", self.group)
    }
}

/// Handoff channel on a shared Redis server.
pub struct RedisHandoffChannel {
    connector: Arc<RedisConnector>,
    keys: HandoffKeys,
    ttl_secs: u64,
    subscribers: Arc<Subscribers>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RedisHandoffChannel {
    /// Connects to the configured server and starts the control listener.
    ///
    /// # Errors
    ///
    /// Fails if Redis is unreachable or the subscription is refused.
    pub async fn connect(config: &HandoffConfig) -> anyhow::Result<Self> {
        let connector = Arc::new(
            RedisConnector::connect(RedisEndpoint::from_handoff(config), config.pool_size).await?,
        );
        Self::with_connector(connector, config).await
    }

    /// Builds the channel on an existing connector.
    ///
    /// # Errors
    ///
    /// Fails if the control subscription cannot be opened.
    pub async fn with_connector(
        connector: Arc<RedisConnector>,
        config: &HandoffConfig,
    ) -> anyhow::Result<Self> {
        let keys = HandoffKeys::new(config.server_group.clone());
        let subscribers = Arc::new(Subscribers::default());

        let mut pubsub = connector.pubsub().await?;
        pubsub.subscribe(keys.control()).await?;
        let forward_to = Arc::clone(&subscribers);
        let listener = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match ControlMessage::decode(msg.get_payload_bytes()) {
                    Ok(message) => forward_to.dispatch(&message),
                    Err(e) => warn!(error = %e, "dropping malformed control message"),
                }
            }
            debug!("control subscription ended");
        });

        info!(group = %config.server_group, ttl_secs = config.token_ttl_secs, "handoff channel ready");
        Ok(Self {
            connector,
            keys,
            ttl_secs: config.token_ttl_secs.max(1),
            subscribers,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// The shared connector, for other messaging on the same server.
    #[must_use]
    pub fn connector(&self) -> &Arc<RedisConnector> {
        &self.connector
    }
}

#[async_trait]
impl HandoffChannel for RedisHandoffChannel {
    async fn is_pending(&self, id: PlayerId) -> anyhow::Result<bool> {
        let mut conn = self.connector.lease().await?;
        let exists: i64 = redis::cmd("EXISTS")
            .arg(self.keys.token(id))
            .query_async(&mut *conn)
            .await?;
        Ok(exists > 0)
    }

    async fn take_payload(&self, id: PlayerId) -> anyhow::Result<Option<Vec<u8>>> {
        let mut conn = self.connector.lease().await?;
        Ok(redis::cmd("GETDEL")
            .arg(self.keys.payload(id))
            .query_async(&mut *conn)
            .await?)
    }

    async fn mark_pending(&self, id: PlayerId) -> anyhow::Result<()> {
        let mut conn = self.connector.lease().await?;
        let _: () = redis::cmd("SET")
            .arg(self.keys.token(id))
            .arg(1)
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn publish(&self, id: PlayerId, payload: Vec<u8>) -> anyhow::Result<()> {
        let mut conn = self.connector.lease().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.keys.payload(id))
            .arg(payload)
            .arg("EX")
            .arg(self.ttl_secs)
            .ignore()
            .cmd("SET")
            .arg(self.keys.token(id))
            .arg(1)
            .arg("EX")
            .arg(self.ttl_secs)
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn clear(&self, id: PlayerId) -> anyhow::Result<()> {
        let mut conn = self.connector.lease().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.keys.token(id))
            .arg(self.keys.payload(id))
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn broadcast(&self, message: &ControlMessage) -> anyhow::Result<()> {
        let bytes = message.encode()?;
        let mut conn = self.connector.lease().await?;
        let _: i64 = redis::cmd("PUBLISH")
            .arg(self.keys.control())
            .arg(bytes)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ControlMessage> {
        self.subscribers.add()
    }

    async fn close(&self) -> anyhow::Result<()> {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.subscribers.clear();
        self.connector.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn keys_are_scoped_by_group() {
        let keys = HandoffKeys::new("skyblock-eu");
        let id = Uuid::nil();
        assert_eq!(
            keys.token(id),
            "skyblock-eu:handoff:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            keys.payload(id),
            "skyblock-eu:handoff-data:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(keys.control(), "skyblock-eu:control");
    }
}
