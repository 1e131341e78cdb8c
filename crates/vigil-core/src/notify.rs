//! Notification fan-out.
//!
//! Relays asynchronous events to whichever targets are online right now.
//! Nothing is queued or retried; offline targets pick the state up from the
//! REST surface later.

use crate::error::RealtimeError;
use crate::registry::ConnectionRegistry;
use crate::store::Store;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use vigil_protocol::{ServerEvent, UserId};

/// An asynchronous notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// `from` sent the target a friend request.
    FriendRequest { from: UserId, payload: Value },
    /// `by` accepted the target's friend request.
    FriendAccepted { by: UserId, payload: Value },
    /// Anything else the platform wants to surface.
    Generic(Value),
}

impl From<Notification> for ServerEvent {
    fn from(notification: Notification) -> Self {
        match notification {
            Notification::FriendRequest { from, payload } => ServerEvent::FriendRequest {
                from_user_id: from,
                payload,
            },
            Notification::FriendAccepted { by, payload } => ServerEvent::FriendAccepted {
                by_user_id: by,
                payload,
            },
            Notification::Generic(payload) => ServerEvent::NotificationNew { payload },
        }
    }
}

/// Delivers notifications to online targets.
pub struct NotificationFanout {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn Store>,
}

impl NotificationFanout {
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn Store>) -> Self {
        Self { registry, store }
    }

    /// Deliver to the given targets. Returns how many were online.
    pub fn notify<'a, I>(&self, targets: I, notification: Notification) -> usize
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        let event = ServerEvent::from(notification);
        let name = event.name();
        let delivered = self.registry.fanout(targets, event);
        debug!(event = name, delivered, "Notification fan-out");
        delivered
    }

    /// Deliver to every friend of `user_id`.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if friends could not be resolved.
    pub async fn notify_friends(
        &self,
        user_id: &str,
        notification: Notification,
    ) -> Result<usize, RealtimeError> {
        let friends = self.store.friends_of(user_id).await?;
        Ok(self.notify(&friends, notification))
    }
}
