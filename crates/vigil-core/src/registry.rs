//! Connection registry.
//!
//! Maps each authenticated identity to at most one live connection and is
//! the single source of truth for presence. All outbound delivery resolves
//! targets here.

use crate::error::RealtimeError;
use crate::ids::now_millis;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use vigil_protocol::{ServerEvent, UserId};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh connection ID.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{:x}", self.0)
    }
}

/// Why the server asks a transport to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection for the same identity took over.
    Superseded,
    /// The server is shutting the connection down.
    Shutdown,
}

impl CloseReason {
    /// Human-readable reason for the close frame.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Superseded => "superseded by a newer connection",
            CloseReason::Shutdown => "server shutdown",
        }
    }
}

/// Instruction queued for a connection's transport task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Write an event to the socket.
    Event(Arc<ServerEvent>),
    /// Close the socket.
    Close(CloseReason),
}

/// Handle to a live transport session.
///
/// The transport task owns the socket and drains the receiving half of the
/// handle's queue; everything else talks to the socket through this handle.
/// The queue is FIFO, so events pushed in order are written in order.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<Outbound>,
    connected_at: u64,
}

impl ConnectionHandle {
    /// Wrap the sending half of a transport queue.
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: ConnectionId::next(),
            sender,
            connected_at: now_millis(),
        }
    }

    /// Create a handle together with the queue the transport task drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// The connection's identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// When the connection was established (ms since epoch).
    #[must_use]
    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    /// Whether the transport task is still draining the queue.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Queue an event. Returns `false` if the transport is gone.
    pub fn send(&self, event: Arc<ServerEvent>) -> bool {
        self.sender.send(Outbound::Event(event)).is_ok()
    }

    /// Ask the transport task to close the socket.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.sender.send(Outbound::Close(reason));
    }
}

/// Outcome of a successful registration.
#[derive(Debug)]
pub enum Registration {
    /// The identity had no live connection.
    Fresh,
    /// The identity's previous connection was closed and replaced.
    Superseded(ConnectionHandle),
}

/// Registry of live connections, one per identity.
///
/// Registration and removal for the same identity are serialized by the
/// identity's shard lock: the last registration wins and explicitly closes
/// the connection it replaces.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Live connection per identity.
    connections: DashMap<UserId, ConnectionHandle>,
    /// Owning identity per live connection.
    owners: DashMap<ConnectionId, UserId>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to an identity, superseding any previous one.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` if the handle's transport is already closed.
    pub fn register(
        &self,
        user_id: &str,
        handle: ConnectionHandle,
    ) -> Result<Registration, RealtimeError> {
        if !handle.is_open() {
            return Err(RealtimeError::Unauthorized(format!(
                "connection {} is closed",
                handle.id()
            )));
        }

        // Lock order is always connections -> owners.
        let previous = match self.connections.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.insert(handle.clone());
                self.owners.remove(&previous.id());
                self.owners.insert(handle.id(), user_id.to_string());
                Some(previous)
            }
            Entry::Vacant(entry) => {
                entry.insert(handle.clone());
                self.owners.insert(handle.id(), user_id.to_string());
                None
            }
        };

        match previous {
            Some(previous) => {
                info!(
                    user = %user_id,
                    old = %previous.id(),
                    new = %handle.id(),
                    "Connection superseded"
                );
                previous.close(CloseReason::Superseded);
                Ok(Registration::Superseded(previous))
            }
            None => {
                debug!(user = %user_id, connection = %handle.id(), "Connection registered");
                Ok(Registration::Fresh)
            }
        }
    }

    /// Remove a connection.
    ///
    /// Returns the owning identity if the connection was that identity's
    /// current one. A superseded connection unregisters as a no-op.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<UserId> {
        let (_, user_id) = self.owners.remove(&connection_id)?;
        let removed = self
            .connections
            .remove_if(&user_id, |_, handle| handle.id() == connection_id);

        removed.map(|_| {
            debug!(user = %user_id, connection = %connection_id, "Connection unregistered");
            user_id
        })
    }

    /// Look up an identity's live connection.
    #[must_use]
    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.connections.get(user_id).map(|h| h.value().clone())
    }

    /// Resolve the identity that owns a connection.
    #[must_use]
    pub fn identity_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.owners.get(&connection_id).map(|u| u.value().clone())
    }

    /// Whether an identity has a live connection.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }

    /// Number of identities online.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.connections.len()
    }

    /// Deliver an event to one identity.
    ///
    /// Returns `false` if the identity is offline; callers treat that as a
    /// no-op delivery, not a failure.
    pub fn deliver(&self, user_id: &str, event: Arc<ServerEvent>) -> bool {
        match self.lookup(user_id) {
            Some(handle) => handle.send(event),
            None => false,
        }
    }

    /// Deliver one event to several identities; absent targets are skipped.
    ///
    /// Returns the number of connections the event was queued on.
    pub fn fanout<'a, I>(&self, targets: I, event: ServerEvent) -> usize
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        let name = event.name();
        let event = Arc::new(event);
        let count = targets
            .into_iter()
            .filter(|user_id| self.deliver(user_id, Arc::clone(&event)))
            .count();
        trace!(event = name, recipients = count, "Fan-out");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pong() -> ServerEvent {
        ServerEvent::Pong { timestamp: None }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::channel();
        let id = handle.id();

        assert!(matches!(
            registry.register("alice", handle),
            Ok(Registration::Fresh)
        ));
        assert!(registry.is_online("alice"));
        assert_eq!(registry.identity_of(id), Some("alice".to_string()));
        assert_eq!(registry.lookup("alice").map(|h| h.id()), Some(id));
        assert!(registry.lookup("bob").is_none());
    }

    #[test]
    fn test_register_rejects_closed_handle() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = ConnectionHandle::channel();
        drop(rx);

        assert!(matches!(
            registry.register("alice", handle),
            Err(RealtimeError::Unauthorized(_))
        ));
        assert!(!registry.is_online("alice"));
    }

    #[test]
    fn test_supersession_closes_previous() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = ConnectionHandle::channel();
        let (second, _second_rx) = ConnectionHandle::channel();
        let first_id = first.id();
        let second_id = second.id();

        registry.register("alice", first).unwrap();
        match registry.register("alice", second).unwrap() {
            Registration::Superseded(old) => assert_eq!(old.id(), first_id),
            Registration::Fresh => panic!("expected supersession"),
        }

        assert!(matches!(
            first_rx.try_recv(),
            Ok(Outbound::Close(CloseReason::Superseded))
        ));
        assert_eq!(registry.online_count(), 1);
        assert_eq!(registry.identity_of(first_id), None);

        // The superseded transport's cleanup must not evict the new one.
        assert_eq!(registry.unregister(first_id), None);
        assert!(registry.is_online("alice"));

        assert_eq!(registry.unregister(second_id), Some("alice".to_string()));
        assert!(!registry.is_online("alice"));
    }

    #[test]
    fn test_fanout_skips_offline_targets() {
        let registry = ConnectionRegistry::new();
        let (alice, mut alice_rx) = ConnectionHandle::channel();
        let (bob, mut bob_rx) = ConnectionHandle::channel();
        registry.register("alice", alice).unwrap();
        registry.register("bob", bob).unwrap();

        let targets = vec!["alice".to_string(), "bob".to_string(), "carol".to_string()];
        assert_eq!(registry.fanout(&targets, pong()), 2);

        assert!(matches!(alice_rx.try_recv(), Ok(Outbound::Event(_))));
        assert!(matches!(bob_rx.try_recv(), Ok(Outbound::Event(_))));
        assert!(!registry.deliver("carol", Arc::new(pong())));
    }

    #[test]
    fn test_deliver_to_dropped_transport() {
        let registry = ConnectionRegistry::new();
        let (alice, rx) = ConnectionHandle::channel();
        registry.register("alice", alice).unwrap();
        drop(rx);

        assert!(!registry.deliver("alice", Arc::new(pong())));
    }
}
