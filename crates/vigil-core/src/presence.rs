//! Presence announcements.
//!
//! Presence itself is the registry: an identity is online while it has a
//! live connection. This module tells interested parties (friends, as
//! resolved through the directory) when that changes.

use crate::error::RealtimeError;
use crate::ids::now_millis;
use crate::registry::ConnectionRegistry;
use crate::store::Store;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use vigil_protocol::{ServerEvent, UserId};

/// Broadcasts presence transitions to friends.
pub struct PresenceService {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn Store>,
    /// When each identity was last seen going offline.
    last_seen: DashMap<UserId, u64>,
}

impl PresenceService {
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn Store>) -> Self {
        Self {
            registry,
            store,
            last_seen: DashMap::new(),
        }
    }

    /// Announce a registration.
    ///
    /// A supersession is reported as one `presence:offline` followed by one
    /// `presence:online`. The user then receives a snapshot of online
    /// friends.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if friends could not be resolved.
    pub async fn announce_online(&self, user_id: &str, superseded: bool) -> Result<(), RealtimeError> {
        let friends = self.store.friends_of(user_id).await?;

        if superseded {
            self.registry.fanout(
                &friends,
                ServerEvent::PresenceOffline {
                    user_id: user_id.to_string(),
                    last_seen: now_millis(),
                },
            );
        }
        let notified = self.registry.fanout(
            &friends,
            ServerEvent::PresenceOnline {
                user_id: user_id.to_string(),
            },
        );
        debug!(user = %user_id, superseded, notified, "Presence: online");

        self.deliver_snapshot(user_id, &friends);
        Ok(())
    }

    /// Send the user the list of their friends that are online.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if friends could not be resolved.
    pub async fn send_snapshot(&self, user_id: &str) -> Result<Vec<UserId>, RealtimeError> {
        let friends = self.store.friends_of(user_id).await?;
        Ok(self.deliver_snapshot(user_id, &friends))
    }

    fn deliver_snapshot(&self, user_id: &str, friends: &[UserId]) -> Vec<UserId> {
        let online: Vec<UserId> = friends
            .iter()
            .filter(|f| self.registry.is_online(f))
            .cloned()
            .collect();
        self.registry.deliver(
            user_id,
            Arc::new(ServerEvent::PresenceSnapshot {
                online: online.clone(),
            }),
        );
        online
    }

    /// Announce that an identity lost its connection.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if friends could not be resolved; `last_seen`
    /// is recorded regardless.
    pub async fn announce_offline(&self, user_id: &str) -> Result<(), RealtimeError> {
        let now = now_millis();
        self.last_seen.insert(user_id.to_string(), now);

        let friends = self.store.friends_of(user_id).await?;
        let notified = self.registry.fanout(
            &friends,
            ServerEvent::PresenceOffline {
                user_id: user_id.to_string(),
                last_seen: now,
            },
        );
        debug!(user = %user_id, notified, "Presence: offline");
        Ok(())
    }

    /// When an identity last went offline.
    #[must_use]
    pub fn last_seen(&self, user_id: &str) -> Option<u64> {
        self.last_seen.get(user_id).map(|t| *t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, Outbound};
    use crate::store::InMemoryStore;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn setup() -> (Arc<ConnectionRegistry>, PresenceService) {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = InMemoryStore::new();
        store.add_friendship("alice", "bob");
        store.add_friendship("alice", "carol");
        let presence = PresenceService::new(Arc::clone(&registry), Arc::new(store));
        (registry, presence)
    }

    fn connect(registry: &ConnectionRegistry, user: &str) -> UnboundedReceiver<Outbound> {
        let (handle, rx) = ConnectionHandle::channel();
        registry.register(user, handle).unwrap();
        rx
    }

    fn names(rx: &mut UnboundedReceiver<Outbound>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(Outbound::Event(event)) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[tokio::test]
    async fn test_online_reaches_friends_and_snapshot() {
        let (registry, presence) = setup();
        let mut bob = connect(&registry, "bob");
        let mut alice = connect(&registry, "alice");

        presence.announce_online("alice", false).await.unwrap();

        assert_eq!(names(&mut bob), vec!["presence:online"]);
        let snapshot = alice.try_recv().unwrap();
        match snapshot {
            Outbound::Event(event) => match &*event {
                ServerEvent::PresenceSnapshot { online } => assert_eq!(online, &vec!["bob"]),
                other => panic!("unexpected event {other:?}"),
            },
            Outbound::Close(_) => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn test_supersession_reports_one_pair() {
        let (registry, presence) = setup();
        let mut bob = connect(&registry, "bob");
        let _first = connect(&registry, "alice");
        presence.announce_online("alice", false).await.unwrap();
        names(&mut bob);

        let _second = connect(&registry, "alice");
        presence.announce_online("alice", true).await.unwrap();

        assert_eq!(names(&mut bob), vec!["presence:offline", "presence:online"]);
    }

    #[tokio::test]
    async fn test_offline_records_last_seen() {
        let (registry, presence) = setup();
        let mut carol = connect(&registry, "carol");

        assert!(presence.last_seen("alice").is_none());
        presence.announce_offline("alice").await.unwrap();

        assert_eq!(names(&mut carol), vec!["presence:offline"]);
        assert!(presence.last_seen("alice").is_some());
    }
}
