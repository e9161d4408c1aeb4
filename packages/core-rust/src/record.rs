//! Player record and the persistence-side wrappers around it.
//!
//! [`PlayerRecord`] is the unit of persistence. Lock metadata is never part
//! of the record itself: backends carry it next to the encoded payload in a
//! [`StoredRow`], and report contention through [`FetchOutcome`].

use serde::{Deserialize, Serialize};

use crate::types::{IslandId, Payload, PlayerId, Value};

/// Durable per-player state: identity, display name and the game payload.
///
/// The identifier is fixed at construction and only exposed through
/// [`PlayerRecord::id`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    id: PlayerId,
    /// Island owned by the player, once one has been assigned.
    pub island_id: Option<IslandId>,
    /// Last known display name.
    pub name: String,
    /// Opaque game-state blob owned by gameplay modules.
    #[serde(default)]
    pub payload: Payload,
}

impl PlayerRecord {
    /// Creates an empty record for a first-time player.
    #[must_use]
    pub fn new(id: PlayerId, name: impl Into<String>) -> Self {
        Self {
            id,
            island_id: None,
            name: name.into(),
            payload: Payload::new(),
        }
    }

    /// Builder-style island assignment.
    #[must_use]
    pub fn with_island(mut self, island_id: IslandId) -> Self {
        self.island_id = Some(island_id);
        self
    }

    /// The player identifier. Immutable for the lifetime of the record.
    #[must_use]
    pub fn id(&self) -> PlayerId {
        self.id
    }

    /// Reads a payload entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Writes a payload entry, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.payload.insert(key.into(), value.into())
    }
}

/// Backend-agnostic persisted row: `{ lock, data }` keyed by player id.
///
/// `lock` is epoch seconds of the last acquisition, 0 when released.
/// `data` is the [`RecordCodec`](crate::codec::RecordCodec) encoding of the
/// player record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRow {
    /// Lock stamp in epoch seconds. 0 = unlocked.
    pub lock: i64,
    /// Epoch seconds of the last durable write.
    #[serde(default)]
    pub written_at: i64,
    /// Encoded player record.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Result of a backend fetch.
///
/// Contention is a first-class state: a [`FetchOutcome::Locked`] record is
/// readable but must not be mutated by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// No record exists for the identifier.
    Absent,
    /// The record exists and (when a lock was requested) is now held by the caller.
    Available(PlayerRecord),
    /// The record exists but another holder's lock is still within its TTL.
    Locked(PlayerRecord),
}

impl FetchOutcome {
    /// Whether the record is held by someone else.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(self, FetchOutcome::Locked(_))
    }

    /// Whether no record exists.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, FetchOutcome::Absent)
    }

    /// The record carried by this outcome, regardless of lock state.
    #[must_use]
    pub fn record(&self) -> Option<&PlayerRecord> {
        match self {
            FetchOutcome::Absent => None,
            FetchOutcome::Available(r) | FetchOutcome::Locked(r) => Some(r),
        }
    }

    /// Consumes the outcome, returning the record only if it is safe to mutate.
    #[must_use]
    pub fn into_available(self) -> Option<PlayerRecord> {
        match self {
            FetchOutcome::Available(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn new_record_is_empty() {
        let id = Uuid::new_v4();
        let record = PlayerRecord::new(id, "steve");
        assert_eq!(record.id(), id);
        assert_eq!(record.name, "steve");
        assert!(record.island_id.is_none());
        assert!(record.payload.is_empty());
    }

    #[test]
    fn set_returns_previous_value() {
        let mut record = PlayerRecord::new(Uuid::new_v4(), "alex");
        assert!(record.set("level", 3).is_none());
        assert_eq!(record.set("level", 4), Some(Value::Int(3)));
        assert_eq!(record.get("level"), Some(&Value::Int(4)));
    }

    #[test]
    fn fetch_outcome_accessors() {
        let record = PlayerRecord::new(Uuid::new_v4(), "alex").with_island(7);

        let locked = FetchOutcome::Locked(record.clone());
        assert!(locked.is_locked());
        assert_eq!(locked.record().and_then(|r| r.island_id), Some(7));
        assert!(locked.into_available().is_none());

        let available = FetchOutcome::Available(record.clone());
        assert!(!available.is_locked());
        assert_eq!(available.into_available(), Some(record));

        assert!(FetchOutcome::Absent.is_absent());
        assert!(FetchOutcome::Absent.record().is_none());
    }
}
