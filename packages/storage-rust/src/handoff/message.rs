//! Control messages carried on the server group's pub/sub stream.

use serde::{Deserialize, Serialize};
use skyhold_core::{IslandId, PlayerId};

/// What a control message announces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlKind {
    /// A process joined the group.
    Started,
    /// A process is shutting down and has flushed its online players.
    Stopping,
    /// Cached lookup state for a player is stale.
    Invalidate {
        /// Player whose cached state should be dropped.
        player: PlayerId,
    },
    /// Cached lookup state for an island is stale.
    InvalidateIsland {
        /// Island whose cached mapping should be dropped.
        island: IslandId,
    },
}

/// One message on the control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Group the sender belongs to. Other groups ignore the message.
    pub server_group: String,
    /// Node id of the sender.
    pub origin: String,
    /// Payload.
    pub kind: ControlKind,
}

impl ControlMessage {
    /// Builds a message from `origin` in `server_group`.
    #[must_use]
    pub fn new(server_group: impl Into<String>, origin: impl Into<String>, kind: ControlKind) -> Self {
        Self {
            server_group: server_group.into(),
            origin: origin.into(),
            kind,
        }
    }

    /// Wire encoding (`MsgPack`).
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Parses a wire message.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }

    /// Whether a receiver in `server_group` with id `node_id` should act on it.
    #[must_use]
    pub fn is_for(&self, server_group: &str, node_id: &str) -> bool {
        self.server_group == server_group && self.origin != node_id
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn wire_round_trip() {
        let message = ControlMessage::new(
            "lobby",
            "node-a",
            ControlKind::Invalidate {
                player: Uuid::new_v4(),
            },
        );
        let decoded = ControlMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn receivers_ignore_own_and_foreign_messages() {
        let message = ControlMessage::new("lobby", "node-a", ControlKind::Started);
        assert!(message.is_for("lobby", "node-b"));
        assert!(!message.is_for("lobby", "node-a"));
        assert!(!message.is_for("survival", "node-b"));
    }
}
