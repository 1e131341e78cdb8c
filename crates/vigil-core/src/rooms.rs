//! Group room subscriptions.
//!
//! A connected member joins a group's room to receive that group's live
//! events. Group fan-out is scoped to the room, so members who never
//! joined (or left) get nothing in real time.

use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tracing::debug;
use vigil_protocol::{GroupId, UserId};

/// Room errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Not joined to the room.
    #[error("Not joined to group: {0}")]
    NotJoined(String),

    /// Maximum rooms per user reached.
    #[error("Maximum group subscriptions reached")]
    MaxRoomsReached,
}

/// Room statistics.
#[derive(Debug, Clone)]
pub struct RoomStats {
    /// Number of rooms with at least one subscriber.
    pub room_count: usize,
    /// Number of users subscribed to any room.
    pub user_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
}

/// Live subscriptions of users to group rooms.
#[derive(Debug)]
pub struct RoomDirectory {
    /// Subscribers per group.
    rooms: DashMap<GroupId, DashSet<UserId>>,
    /// Groups per user.
    memberships: DashMap<UserId, DashSet<GroupId>>,
    max_rooms_per_user: usize,
}

impl RoomDirectory {
    /// Create a directory with a per-user subscription limit.
    #[must_use]
    pub fn new(max_rooms_per_user: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            max_rooms_per_user,
        }
    }

    /// Subscribe a user to a group room.
    ///
    /// Returns `false` if the user was already subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error if the user reached the subscription limit.
    pub fn join(&self, user_id: &str, group_id: &str) -> Result<bool, RoomError> {
        let groups = self.memberships.entry(user_id.to_string()).or_default();

        if groups.contains(group_id) {
            return Ok(false);
        }
        if groups.len() >= self.max_rooms_per_user {
            return Err(RoomError::MaxRoomsReached);
        }

        groups.insert(group_id.to_string());
        self.rooms
            .entry(group_id.to_string())
            .or_default()
            .insert(user_id.to_string());

        debug!(user = %user_id, group = %group_id, "Joined group room");
        Ok(true)
    }

    /// Unsubscribe a user from a group room.
    ///
    /// # Errors
    ///
    /// Returns an error if the user was not subscribed.
    pub fn leave(&self, user_id: &str, group_id: &str) -> Result<(), RoomError> {
        let removed = self
            .memberships
            .get(user_id)
            .and_then(|groups| groups.remove(group_id))
            .is_some();
        if !removed {
            return Err(RoomError::NotJoined(group_id.to_string()));
        }

        self.remove_subscriber(group_id, user_id);
        debug!(user = %user_id, group = %group_id, "Left group room");
        Ok(())
    }

    /// Unsubscribe a user from every room.
    pub fn leave_all(&self, user_id: &str) {
        if let Some((_, groups)) = self.memberships.remove(user_id) {
            for group_id in groups.iter() {
                self.remove_subscriber(group_id.as_str(), user_id);
            }
        }

        debug!(user = %user_id, "Left all group rooms");
    }

    fn remove_subscriber(&self, group_id: &str, user_id: &str) {
        if let Some(room) = self.rooms.get(group_id) {
            room.remove(user_id);
        }
        self.rooms.remove_if(group_id, |_, room| room.is_empty());
    }

    /// Whether a user is subscribed to a room.
    #[must_use]
    pub fn is_subscribed(&self, user_id: &str, group_id: &str) -> bool {
        self.rooms
            .get(group_id)
            .map(|room| room.contains(user_id))
            .unwrap_or(false)
    }

    /// Users subscribed to a room.
    #[must_use]
    pub fn subscribers(&self, group_id: &str) -> Vec<UserId> {
        self.rooms
            .get(group_id)
            .map(|room| room.iter().map(|u| u.clone()).collect())
            .unwrap_or_default()
    }

    /// Rooms a user is subscribed to.
    #[must_use]
    pub fn groups_of(&self, user_id: &str) -> Vec<GroupId> {
        self.memberships
            .get(user_id)
            .map(|groups| groups.iter().map(|g| g.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn stats(&self) -> RoomStats {
        RoomStats {
            room_count: self.rooms.len(),
            user_count: self.memberships.len(),
            total_subscriptions: self.memberships.iter().map(|g| g.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_leave() {
        let rooms = RoomDirectory::new(10);

        assert!(rooms.join("alice", "choir").unwrap());
        assert!(!rooms.join("alice", "choir").unwrap());
        assert!(rooms.is_subscribed("alice", "choir"));
        assert_eq!(rooms.subscribers("choir"), vec!["alice"]);

        rooms.leave("alice", "choir").unwrap();
        assert!(!rooms.is_subscribed("alice", "choir"));
        assert!(matches!(
            rooms.leave("alice", "choir"),
            Err(RoomError::NotJoined(_))
        ));
        // Empty rooms are dropped
        assert_eq!(rooms.stats().room_count, 0);
    }

    #[test]
    fn test_room_limit() {
        let rooms = RoomDirectory::new(1);

        rooms.join("alice", "choir").unwrap();
        assert!(matches!(
            rooms.join("alice", "youth"),
            Err(RoomError::MaxRoomsReached)
        ));
    }

    #[test]
    fn test_leave_all() {
        let rooms = RoomDirectory::new(10);

        rooms.join("alice", "choir").unwrap();
        rooms.join("alice", "youth").unwrap();
        rooms.join("bob", "choir").unwrap();

        rooms.leave_all("alice");

        assert!(rooms.groups_of("alice").is_empty());
        assert_eq!(rooms.subscribers("choir"), vec!["bob"]);
        assert!(rooms.subscribers("youth").is_empty());

        let stats = rooms.stats();
        assert_eq!(stats.room_count, 1);
        assert_eq!(stats.user_count, 1);
        assert_eq!(stats.total_subscriptions, 1);
    }
}
