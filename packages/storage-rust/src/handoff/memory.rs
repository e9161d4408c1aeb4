//! In-process [`HandoffChannel`].
//!
//! Several managers sharing one `Arc<MemoryHandoffChannel>` behave like
//! processes sharing one Redis. Expiry uses tokio's clock, so paused-time
//! tests can step past the TTL.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use skyhold_core::PlayerId;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::handoff::channel::{HandoffChannel, Subscribers};
use crate::handoff::message::ControlMessage;

/// Handoff channel held entirely in memory.
pub struct MemoryHandoffChannel {
    ttl: Duration,
    tokens: DashMap<PlayerId, Instant>,
    payloads: DashMap<PlayerId, (Vec<u8>, Instant)>,
    subscribers: Subscribers,
}

impl MemoryHandoffChannel {
    /// Creates a channel whose entries expire after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: DashMap::new(),
            payloads: DashMap::new(),
            subscribers: Subscribers::default(),
        }
    }
}

#[async_trait]
impl HandoffChannel for MemoryHandoffChannel {
    async fn is_pending(&self, id: PlayerId) -> anyhow::Result<bool> {
        let now = Instant::now();
        let live = self.tokens.get(&id).is_some_and(|expiry| *expiry > now);
        if !live {
            self.tokens.remove_if(&id, |_, expiry| *expiry <= now);
        }
        Ok(live)
    }

    async fn take_payload(&self, id: PlayerId) -> anyhow::Result<Option<Vec<u8>>> {
        let now = Instant::now();
        Ok(self
            .payloads
            .remove(&id)
            .and_then(|(_, (payload, expiry))| (expiry > now).then_some(payload)))
    }

    async fn mark_pending(&self, id: PlayerId) -> anyhow::Result<()> {
        self.tokens.insert(id, Instant::now() + self.ttl);
        Ok(())
    }

    async fn publish(&self, id: PlayerId, payload: Vec<u8>) -> anyhow::Result<()> {
        let expiry = Instant::now() + self.ttl;
        self.payloads.insert(id, (payload, expiry));
        self.tokens.insert(id, expiry);
        Ok(())
    }

    async fn clear(&self, id: PlayerId) -> anyhow::Result<()> {
        self.tokens.remove(&id);
        self.payloads.remove(&id);
        Ok(())
    }

    async fn broadcast(&self, message: &ControlMessage) -> anyhow::Result<()> {
        self.subscribers.dispatch(message);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ControlMessage> {
        self.subscribers.add()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.subscribers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::handoff::message::ControlKind;

    #[tokio::test(start_paused = true)]
    async fn payload_is_read_once() {
        let channel = MemoryHandoffChannel::new(Duration::from_secs(10));
        let id = Uuid::new_v4();
        channel.publish(id, vec![1, 2, 3]).await.unwrap();

        assert!(channel.is_pending(id).await.unwrap());
        assert_eq!(channel.take_payload(id).await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(channel.take_payload(id).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let channel = MemoryHandoffChannel::new(Duration::from_secs(10));
        let id = Uuid::new_v4();
        channel.publish(id, vec![9]).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!channel.is_pending(id).await.unwrap());
        assert_eq!(channel.take_payload(id).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn token_can_precede_payload() {
        let channel = MemoryHandoffChannel::new(Duration::from_secs(10));
        let id = Uuid::new_v4();
        channel.mark_pending(id).await.unwrap();

        assert!(channel.is_pending(id).await.unwrap());
        assert_eq!(channel.take_payload(id).await.unwrap(), None);
        channel.publish(id, vec![4]).await.unwrap();
        assert_eq!(channel.take_payload(id).await.unwrap(), Some(vec![4]));
    }

    #[tokio::test]
    async fn clear_drops_token_and_payload() {
        let channel = MemoryHandoffChannel::new(Duration::from_secs(10));
        let id = Uuid::new_v4();
        channel.publish(id, vec![9]).await.unwrap();
        channel.clear(id).await.unwrap();
        assert!(!channel.is_pending(id).await.unwrap());
        assert_eq!(channel.take_payload(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let channel = MemoryHandoffChannel::new(Duration::from_secs(10));
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();
        let message = ControlMessage::new("g", "node", ControlKind::Started);
        channel.broadcast(&message).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), message);
        assert_eq!(b.recv().await.unwrap(), message);

        channel.close().await.unwrap();
        assert!(a.recv().await.is_none());
    }
}
