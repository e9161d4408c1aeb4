//! Timestamp-based advisory lock shared by every durable backend.
//!
//! A record is held when its stamp is nonzero and no older than the TTL.
//! Stale stamps are ignored, so a crashed holder can never strand a record
//! for longer than one TTL.

use std::time::Duration;

/// Default lock TTL in seconds.
pub const DEFAULT_LOCK_TTL_SECS: i64 = 30;

/// Stamp value meaning "released".
pub const UNLOCKED: i64 = 0;

/// Lock time-to-live policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    ttl_secs: i64,
}

impl LockPolicy {
    /// Creates a policy honoring holds for `ttl`. Sub-second parts are dropped.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_secs: i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX),
        }
    }

    /// TTL in whole seconds.
    #[must_use]
    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    /// Returns `true` if `stamp` is a live hold at time `now` (both epoch seconds).
    #[must_use]
    pub fn is_held(&self, stamp: i64, now: i64) -> bool {
        stamp != UNLOCKED && now.saturating_sub(stamp) <= self.ttl_secs
    }

    /// Oldest stamp still honored at `now`. Stamps strictly below it are stale.
    ///
    /// Used by backends that acquire with a conditional update:
    /// `lock = 0 OR lock < stale_before(now)`.
    #[must_use]
    pub fn stale_before(&self, now: i64) -> i64 {
        now.saturating_sub(self.ttl_secs)
    }

    /// Stamp to persist alongside a store: released, or refreshed to `now`.
    #[must_use]
    pub fn stamp_for_store(unlock: bool, now: i64) -> i64 {
        if unlock {
            UNLOCKED
        } else {
            now
        }
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_LOCK_TTL_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_stamp_is_never_held() {
        let policy = LockPolicy::default();
        assert!(!policy.is_held(UNLOCKED, 1_000));
    }

    #[test]
    fn fresh_stamp_is_held_until_ttl_elapses() {
        let policy = LockPolicy::default();
        let stamp = 1_000;
        assert!(policy.is_held(stamp, stamp));
        assert!(policy.is_held(stamp, stamp + 30));
        assert!(!policy.is_held(stamp, stamp + 31));
    }

    #[test]
    fn stale_before_matches_is_held() {
        let policy = LockPolicy::new(Duration::from_secs(10));
        let now = 5_000;
        let boundary = policy.stale_before(now);
        assert!(policy.is_held(boundary, now));
        assert!(!policy.is_held(boundary - 1, now));
    }

    #[test]
    fn stamp_for_store() {
        assert_eq!(LockPolicy::stamp_for_store(true, 42), UNLOCKED);
        assert_eq!(LockPolicy::stamp_for_store(false, 42), 42);
    }

    #[test]
    fn sub_second_ttl_truncates() {
        let policy = LockPolicy::new(Duration::from_millis(2_900));
        assert_eq!(policy.ttl_secs(), 2);
    }
}
