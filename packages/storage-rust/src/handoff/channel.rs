//! Cross-process handoff contract.

use async_trait::async_trait;
use parking_lot::Mutex;
use skyhold_core::PlayerId;
use tokio::sync::mpsc;

use crate::handoff::message::ControlMessage;

/// Ephemeral transfer of a player record between processes.
///
/// Per player there are two independent expiring entries: a "transfer
/// pending" token and the payload itself, which is deleted when read.
/// Implementations also carry [`ControlMessage`]s between processes.
#[async_trait]
pub trait HandoffChannel: Send + Sync {
    /// Whether a transfer token for `id` is live.
    async fn is_pending(&self, id: PlayerId) -> anyhow::Result<bool>;

    /// Removes and returns the transferred payload, if it has arrived.
    async fn take_payload(&self, id: PlayerId) -> anyhow::Result<Option<Vec<u8>>>;

    /// Sets only the token for `id`, so a receiver waits for the payload
    /// instead of reading the backend.
    async fn mark_pending(&self, id: PlayerId) -> anyhow::Result<()>;

    /// Publishes payload and token for `id`, both expiring after the TTL.
    async fn publish(&self, id: PlayerId, payload: Vec<u8>) -> anyhow::Result<()>;

    /// Drops the token and any unread payload for `id`.
    async fn clear(&self, id: PlayerId) -> anyhow::Result<()>;

    /// Sends a control message to every subscriber in the group.
    async fn broadcast(&self, message: &ControlMessage) -> anyhow::Result<()>;

    /// Receives every control message seen by this channel, including this
    /// process's own; receivers filter with [`ControlMessage::is_for`].
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ControlMessage>;

    /// Stops background tasks and releases connections.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Fan-out list of control message subscribers.
#[derive(Default)]
pub struct Subscribers {
    senders: Mutex<Vec<mpsc::UnboundedSender<ControlMessage>>>,
}

impl Subscribers {
    /// Registers a new receiver.
    pub fn add(&self) -> mpsc::UnboundedReceiver<ControlMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }

    /// Delivers `message` to every live receiver and forgets dropped ones.
    pub fn dispatch(&self, message: &ControlMessage) {
        self.senders
            .lock()
            .retain(|tx| tx.send(message.clone()).is_ok());
    }

    /// Number of live receivers as of the last dispatch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    /// Whether nobody is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.senders.lock().is_empty()
    }

    /// Drops every sender, ending all receivers.
    pub fn clear(&self) {
        self.senders.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::message::ControlKind;

    #[test]
    fn dispatch_skips_dropped_receivers() {
        let subscribers = Subscribers::default();
        let mut kept = subscribers.add();
        drop(subscribers.add());
        assert_eq!(subscribers.len(), 2);

        let message = ControlMessage::new("g", "n", ControlKind::Stopping);
        subscribers.dispatch(&message);
        assert_eq!(subscribers.len(), 1);
        assert_eq!(kept.try_recv().unwrap(), message);
    }
}
