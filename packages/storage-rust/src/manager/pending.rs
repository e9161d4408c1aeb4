//! Records synthesized for first-time players whose durable insert has not
//! completed yet.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use skyhold_core::PlayerId;
use tokio::sync::watch;
use tokio::time::Instant;

struct PendingInsert {
    started: Instant,
    done: watch::Receiver<bool>,
}

/// Completion handle for one pending insert. Finishing (or dropping) it
/// wakes every waiter.
pub struct PendingTicket {
    id: PlayerId,
    done: watch::Sender<bool>,
}

impl PendingTicket {
    /// Player the insert is for.
    #[must_use]
    pub fn id(&self) -> PlayerId {
        self.id
    }
}

/// In-flight inserts keyed by player.
#[derive(Default)]
pub struct PendingInserts {
    entries: DashMap<PlayerId, PendingInsert>,
}

impl PendingInserts {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an insert for `id`. Returns `None` if one is already in flight.
    pub fn begin(&self, id: PlayerId) -> Option<PendingTicket> {
        match self.entries.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(false);
                slot.insert(PendingInsert {
                    started: Instant::now(),
                    done: rx,
                });
                Some(PendingTicket { id, done: tx })
            }
        }
    }

    /// Marks the insert durable and removes it.
    pub fn finish(&self, ticket: PendingTicket) {
        self.entries.remove(&ticket.id);
        let _ = ticket.done.send(true);
    }

    /// Waits until the insert for `id`, if any, has finished.
    pub async fn wait(&self, id: PlayerId) {
        let Some(mut done) = self.entries.get(&id).map(|e| e.done.clone()) else {
            return;
        };
        // A dropped ticket ends the wait as well.
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Waits for every insert registered at the time of the call.
    pub async fn wait_all(&self) {
        let receivers: Vec<_> = self.entries.iter().map(|e| e.done.clone()).collect();
        for mut done in receivers {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    /// How long the insert for `id` has been in flight.
    #[must_use]
    pub fn age(&self, id: PlayerId) -> Option<Duration> {
        self.entries.get(&id).map(|e| e.started.elapsed())
    }

    /// Whether an insert for `id` is in flight.
    #[must_use]
    pub fn contains(&self, id: PlayerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of inserts in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn second_begin_is_refused_and_age_grows() {
        let pending = PendingInserts::new();
        let id = Uuid::new_v4();
        let ticket = pending.begin(id).unwrap();
        assert!(pending.begin(id).is_none());

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(pending.age(id), Some(Duration::from_millis(250)));

        pending.finish(ticket);
        assert!(pending.age(id).is_none());
        assert!(pending.begin(id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_once_finished() {
        let pending = Arc::new(PendingInserts::new());
        let id = Uuid::new_v4();
        let ticket = pending.begin(id).unwrap();

        let finisher = Arc::clone(&pending);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            finisher.finish(ticket);
        });

        let started = Instant::now();
        pending.wait(id).await;
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn dropped_ticket_releases_waiters() {
        let pending = PendingInserts::new();
        let id = Uuid::new_v4();
        drop(pending.begin(id).unwrap());
        pending.wait(id).await;
        pending.wait_all().await;
    }
}
