//! Counterpart presence tracking.
//!
//! Maintains which counterparts are online and when each was last seen.
//! Nothing here is persisted: the tracker is emptied whenever a new
//! transport connection is established and rebuilt from
//! `user_connected` / `user_disconnected` events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use tasker_shared::UserId;

/// Presence of one counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceRecord {
    pub online: bool,
    /// Time of the most recent disconnect. Cleared when the user comes back.
    pub last_seen: Option<DateTime<Utc>>,
}

/// Tracks presence for every counterpart we have heard about.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    records: HashMap<UserId, PresenceRecord>,
}

impl PresenceTracker {
    /// Create a new, empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `user` came online.
    pub fn on_connected(&mut self, user: UserId) {
        debug!(user = %user, "Counterpart online");
        self.records.insert(
            user,
            PresenceRecord {
                online: true,
                last_seen: None,
            },
        );
    }

    /// Record that `user` went offline at `now`.
    pub fn on_disconnected(&mut self, user: UserId, now: DateTime<Utc>) {
        debug!(user = %user, "Counterpart offline");
        self.records.insert(
            user,
            PresenceRecord {
                online: false,
                last_seen: Some(now),
            },
        );
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.records.get(user).map_or(false, |r| r.online)
    }

    pub fn last_seen(&self, user: &UserId) -> Option<DateTime<Utc>> {
        self.records.get(user).and_then(|r| r.last_seen)
    }

    pub fn get(&self, user: &UserId) -> Option<PresenceRecord> {
        self.records.get(user).copied()
    }

    /// Ids of everyone currently online.
    pub fn online_users(&self) -> Vec<UserId> {
        self.records
            .iter()
            .filter(|(_, r)| r.online)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.records.values().filter(|r| r.online).count()
    }

    /// Forget everything. Called when a new connection is established.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_connect_disconnect() {
        let mut tracker = PresenceTracker::new();
        let ana = UserId::from("ana");

        assert!(!tracker.is_online(&ana));
        assert_eq!(tracker.last_seen(&ana), None);

        tracker.on_connected(ana.clone());
        assert!(tracker.is_online(&ana));
        assert_eq!(tracker.online_count(), 1);

        tracker.on_disconnected(ana.clone(), at(1_000));
        assert!(!tracker.is_online(&ana));
        assert_eq!(tracker.last_seen(&ana), Some(at(1_000)));
        assert_eq!(tracker.online_count(), 0);
    }

    #[test]
    fn test_reconnect_clears_last_seen() {
        let mut tracker = PresenceTracker::new();
        let ana = UserId::from("ana");

        tracker.on_disconnected(ana.clone(), at(1_000));
        tracker.on_connected(ana.clone());
        assert_eq!(
            tracker.get(&ana),
            Some(PresenceRecord {
                online: true,
                last_seen: None
            })
        );
    }

    #[test]
    fn test_clear_forgets_everyone() {
        let mut tracker = PresenceTracker::new();
        tracker.on_connected(UserId::from("a"));
        tracker.on_connected(UserId::from("b"));
        assert_eq!(tracker.online_users().len(), 2);

        tracker.clear();
        assert!(tracker.online_users().is_empty());
        assert!(!tracker.is_online(&UserId::from("a")));
    }
}
