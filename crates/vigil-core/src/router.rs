//! Event router.
//!
//! The single ingress point for client events. Every event is resolved to
//! its sender, validated, authorized, and dispatched to the service that
//! owns it. Business errors become an `error` event for the originating
//! connection only.

use crate::call::{CallConfig, CallService};
use crate::conversation::Conversation;
use crate::delivery::{ConversationService, DEFAULT_RETAINED_MESSAGES};
use crate::error::RealtimeError;
use crate::notify::NotificationFanout;
use crate::presence::PresenceService;
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, Registration};
use crate::rooms::RoomDirectory;
use crate::store::{RtcTokenIssuer, Store};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use vigil_protocol::{ClientEvent, ConversationTarget, ServerEvent, UserId};

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Call service settings.
    pub calls: CallConfig,
    /// Maximum group rooms one user may subscribe to.
    pub max_rooms_per_user: usize,
    /// Messages kept in memory per conversation.
    pub retained_messages: usize,
    /// How long an untouched conversation stays in memory.
    pub idle_conversation: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            calls: CallConfig::default(),
            max_rooms_per_user: 100,
            retained_messages: DEFAULT_RETAINED_MESSAGES,
            idle_conversation: Duration::from_secs(1800),
        }
    }
}

/// Wires the realtime services together and routes events between them.
pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomDirectory>,
    conversations: Arc<ConversationService>,
    calls: Arc<CallService>,
    presence: Arc<PresenceService>,
    notifications: Arc<NotificationFanout>,
    store: Arc<dyn Store>,
    idle_conversation: Duration,
}

impl EventRouter {
    /// Create a router and the services behind it.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        issuer: Arc<dyn RtcTokenIssuer>,
        config: RouterConfig,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomDirectory::new(config.max_rooms_per_user));

        Self {
            conversations: Arc::new(
                ConversationService::new(
                    Arc::clone(&registry),
                    Arc::clone(&rooms),
                    Arc::clone(&store),
                )
                .with_retention(config.retained_messages),
            ),
            calls: Arc::new(CallService::new(
                Arc::clone(&registry),
                Arc::clone(&store),
                issuer,
                config.calls,
            )),
            presence: Arc::new(PresenceService::new(
                Arc::clone(&registry),
                Arc::clone(&store),
            )),
            notifications: Arc::new(NotificationFanout::new(
                Arc::clone(&registry),
                Arc::clone(&store),
            )),
            registry,
            rooms,
            store,
            idle_conversation: config.idle_conversation,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn rooms(&self) -> &Arc<RoomDirectory> {
        &self.rooms
    }

    #[must_use]
    pub fn conversations(&self) -> &Arc<ConversationService> {
        &self.conversations
    }

    #[must_use]
    pub fn calls(&self) -> &Arc<CallService> {
        &self.calls
    }

    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceService> {
        &self.presence
    }

    #[must_use]
    pub fn notifications(&self) -> &Arc<NotificationFanout> {
        &self.notifications
    }

    /// Register an authenticated connection and announce its presence.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` if the connection's transport already closed.
    pub async fn connect(
        &self,
        user_id: &str,
        handle: ConnectionHandle,
    ) -> Result<ConnectionId, RealtimeError> {
        let connection_id = handle.id();
        let superseded = matches!(
            self.registry.register(user_id, handle)?,
            Registration::Superseded(_)
        );

        if let Err(e) = self.presence.announce_online(user_id, superseded).await {
            warn!(user = %user_id, error = %e, "Presence announcement failed");
        }
        info!(user = %user_id, connection = %connection_id, superseded, "Connected");
        Ok(connection_id)
    }

    /// Tear down a closed connection.
    ///
    /// Only the identity's current connection triggers the cascade (rooms,
    /// open conversation, calls, presence); a superseded one is ignored.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let Some(user_id) = self.registry.unregister(connection_id) else {
            debug!(connection = %connection_id, "Stale connection closed");
            return;
        };

        self.rooms.leave_all(&user_id);
        self.conversations.forget_viewer(&user_id);
        self.calls.disconnect(&user_id).await;
        if let Err(e) = self.presence.announce_offline(&user_id).await {
            warn!(user = %user_id, error = %e, "Presence announcement failed");
        }
        info!(user = %user_id, connection = %connection_id, "Disconnected");
    }

    /// Route an inbound event.
    ///
    /// Returns the `error` event to write back to the originating connection
    /// if the event was rejected.
    pub async fn route(&self, connection_id: ConnectionId, event: ClientEvent) -> Option<ServerEvent> {
        let name = event.name();
        match self.handle(connection_id, event).await {
            Ok(()) => None,
            Err(e) => {
                warn!(connection = %connection_id, event = name, kind = e.kind(), error = %e, "Event rejected");
                Some(ServerEvent::error(Some(name), e.code(), e.to_string()))
            }
        }
    }

    /// Validate, authorize, and dispatch an inbound event.
    ///
    /// # Errors
    ///
    /// Returns the error the originating connection should be told about.
    pub async fn handle(
        &self,
        connection_id: ConnectionId,
        event: ClientEvent,
    ) -> Result<(), RealtimeError> {
        let user = self
            .registry
            .identity_of(connection_id)
            .ok_or(RealtimeError::Unauthenticated)?;
        event
            .validate()
            .map_err(|e| RealtimeError::InvalidEvent(e.to_string()))?;

        debug!(user = %user, event = event.name(), "Dispatching");
        let target = event.conversation_target();

        match event {
            ClientEvent::UserOnline => {
                self.presence.send_snapshot(&user).await?;
            }
            ClientEvent::MessageSend { content, .. } => {
                let conversation = self.resolve(&user, target).await?;
                self.conversations
                    .send(&user, &conversation, content)
                    .await?;
            }
            ClientEvent::MessageTyping { is_typing, .. } => {
                let conversation = self.resolve(&user, target).await?;
                self.conversations
                    .set_typing(&user, &conversation, is_typing)
                    .await?;
            }
            ClientEvent::MessageReact {
                message_id,
                reaction,
            } => {
                self.conversations
                    .react(&user, message_id, &reaction)
                    .await?;
            }
            ClientEvent::MessageDelete { message_id } => {
                self.conversations.delete(&user, message_id).await?;
            }
            ClientEvent::MessageRead { .. } => {
                let conversation = self.resolve(&user, target).await?;
                self.conversations
                    .mark_read(&user, &conversation)
                    .await?;
            }
            ClientEvent::ConversationActive { .. } => {
                let key = match target {
                    Some(_) => Some(self.resolve(&user, target).await?.key().clone()),
                    None => None,
                };
                self.conversations.set_active(&user, key);
            }
            ClientEvent::GroupJoin { group_id } => {
                self.join_group(&user, &group_id).await?;
            }
            ClientEvent::GroupLeave { group_id } => {
                self.rooms
                    .leave(&user, &group_id)
                    .map_err(|e| RealtimeError::InvalidEvent(e.to_string()))?;
                self.registry
                    .deliver(&user, Arc::new(ServerEvent::GroupLeft { group_id }));
            }
            ClientEvent::CallInitiate { receiver_id, offer } => {
                let call_id = self.calls.initiate(&user, &receiver_id, offer).await?;
                self.registry.deliver(
                    &user,
                    Arc::new(ServerEvent::CallRinging {
                        call_id,
                        callee_id: receiver_id,
                    }),
                );
            }
            ClientEvent::CallAnswer { caller_id, answer } => {
                self.calls.answer(&user, &caller_id, answer).await?;
            }
            ClientEvent::CallReject { caller_id } => {
                self.calls.reject(&user, &caller_id).await?;
            }
            ClientEvent::CallIceCandidate { user_id, candidate } => {
                self.calls
                    .exchange_ice_candidate(&user, &user_id, candidate)?;
            }
            ClientEvent::CallEnd { user_id } => {
                self.calls.hang_up(&user, &user_id).await?;
            }
            ClientEvent::CallMediaState { call_id, patch } => {
                self.calls
                    .update_participant_status(&call_id, &user, &patch)?;
            }
            ClientEvent::Ping { timestamp } => {
                self.registry
                    .deliver(&user, Arc::new(ServerEvent::Pong { timestamp }));
            }
        }
        Ok(())
    }

    async fn resolve(
        &self,
        user: &str,
        target: Option<ConversationTarget>,
    ) -> Result<Conversation, RealtimeError> {
        let target = target.ok_or_else(|| {
            RealtimeError::InvalidEvent("receiverId or groupId is required".to_string())
        })?;
        Conversation::resolve(self.store.as_ref(), user, &target).await
    }

    async fn join_group(&self, user: &str, group_id: &str) -> Result<(), RealtimeError> {
        let members = self
            .store
            .group_members(group_id)
            .await?
            .ok_or_else(|| RealtimeError::ConversationNotFound(group_id.to_string()))?;
        if !members.iter().any(|m| m == user) {
            return Err(RealtimeError::Forbidden(format!(
                "{user} is not a member of group {group_id}"
            )));
        }

        self.rooms
            .join(user, group_id)
            .map_err(|e| RealtimeError::Forbidden(e.to_string()))?;
        self.registry.deliver(
            user,
            Arc::new(ServerEvent::GroupJoined {
                group_id: group_id.to_string(),
            }),
        );
        Ok(())
    }

    /// Release memory held for idle conversations and long-ended calls.
    pub fn sweep(&self) {
        let conversations = self.conversations.evict_idle(self.idle_conversation);
        let calls = self.calls.prune_ended();
        debug!(conversations, calls, "Sweep finished");
    }

    /// Deliver one event to several identities; offline targets are skipped.
    pub fn fanout<'a, I>(&self, targets: I, event: ServerEvent) -> usize
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        self.registry.fanout(targets, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;
    use crate::store::{InMemoryStore, UnsignedTokenIssuer};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;
    use vigil_protocol::{CallEndReason, ErrorCode, MediaStatePatch, MessageStatus};

    fn router_with(store: InMemoryStore) -> EventRouter {
        EventRouter::new(
            Arc::new(store),
            Arc::new(UnsignedTokenIssuer),
            RouterConfig::default(),
        )
    }

    async fn connect(router: &EventRouter, user: &str) -> (ConnectionId, UnboundedReceiver<Outbound>) {
        let (handle, rx) = ConnectionHandle::channel();
        let id = router.connect(user, handle).await.unwrap();
        (id, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            if let Outbound::Event(event) = outbound {
                events.push((*event).clone());
            }
        }
        events
    }

    fn send_to(receiver: &str, content: &str) -> ClientEvent {
        ClientEvent::MessageSend {
            receiver_id: Some(receiver.into()),
            group_id: None,
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn test_unauthenticated_connection() {
        let router = router_with(InMemoryStore::new());
        let (handle, _rx) = ConnectionHandle::channel();

        let error = router
            .route(handle.id(), ClientEvent::Ping { timestamp: None })
            .await;
        assert!(matches!(
            error,
            Some(ServerEvent::Error { code: ErrorCode::Unauthenticated, .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_event_goes_to_originator_only() {
        let router = router_with(InMemoryStore::new());
        let (alice, mut alice_rx) = connect(&router, "alice").await;
        let (_, mut bob_rx) = connect(&router, "bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let error = router.route(alice, send_to("bob", "   ")).await;
        match error {
            Some(ServerEvent::Error { event, code, .. }) => {
                assert_eq!(event.as_deref(), Some("message:send"));
                assert_eq!(code, ErrorCode::InvalidEvent);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_direct_message_round_trip() {
        let router = router_with(InMemoryStore::new());
        let (alice, mut alice_rx) = connect(&router, "alice").await;
        let (bob, mut bob_rx) = connect(&router, "bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let active = ClientEvent::ConversationActive {
            receiver_id: Some("alice".into()),
            group_id: None,
        };
        assert!(router.route(bob, active).await.is_none());
        assert!(router.route(alice, send_to("bob", "Hello")).await.is_none());

        let bob_events = drain(&mut bob_rx);
        assert!(matches!(
            &bob_events[0],
            ServerEvent::MessageNew { message, .. } if message.content == "Hello"
        ));
        assert!(matches!(bob_events[1], ServerEvent::MessageDelivered { .. }));

        let read = ClientEvent::MessageRead {
            receiver_id: Some("alice".into()),
            group_id: None,
        };
        assert!(router.route(bob, read).await.is_none());

        let names: Vec<&str> = drain(&mut alice_rx).iter().map(ServerEvent::name).collect();
        assert_eq!(names, vec!["message:sent", "message:delivered", "messages:read"]);
        let key = crate::conversation::ConversationKey::direct("alice", "bob");
        assert_eq!(
            router.conversations().history(&key).await[0].status,
            MessageStatus::Read
        );
    }

    #[tokio::test]
    async fn test_read_of_quiet_conversation_is_silent() {
        let router = router_with(InMemoryStore::new());
        let (alice, mut alice_rx) = connect(&router, "alice").await;
        let (bob, mut bob_rx) = connect(&router, "bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let read = ClientEvent::MessageRead {
            receiver_id: Some("alice".into()),
            group_id: None,
        };
        assert!(router.route(bob, read).await.is_none());
        assert!(drain(&mut bob_rx).is_empty());
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_blocked_direct_message() {
        let store = InMemoryStore::new();
        store.block("bob", "alice");
        let router = router_with(store);
        let (alice, _alice_rx) = connect(&router, "alice").await;

        let error = router.route(alice, send_to("bob", "hi")).await;
        assert!(matches!(
            error,
            Some(ServerEvent::Error { code: ErrorCode::Forbidden, .. })
        ));
    }

    #[tokio::test]
    async fn test_group_join_scopes_fanout() {
        let store = InMemoryStore::new();
        store.set_group("choir", ["alice", "bob"]);
        let router = router_with(store);
        let (alice, mut alice_rx) = connect(&router, "alice").await;
        let (bob, mut bob_rx) = connect(&router, "bob").await;
        let (mallory, _) = connect(&router, "mallory").await;

        let join = |group: &str| ClientEvent::GroupJoin {
            group_id: group.into(),
        };
        assert!(router.route(alice, join("choir")).await.is_none());
        assert!(router.route(bob, join("choir")).await.is_none());
        assert!(matches!(
            router.route(mallory, join("choir")).await,
            Some(ServerEvent::Error { code: ErrorCode::Forbidden, .. })
        ));
        assert!(matches!(
            router.route(mallory, join("band")).await,
            Some(ServerEvent::Error { code: ErrorCode::ConversationNotFound, .. })
        ));
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let send = ClientEvent::MessageSend {
            receiver_id: None,
            group_id: Some("choir".into()),
            content: "Rehearsal at 7".into(),
        };
        assert!(router.route(alice, send).await.is_none());
        assert!(matches!(
            drain(&mut bob_rx).as_slice(),
            [ServerEvent::MessageNew { .. }]
        ));

        assert!(router
            .route(bob, ClientEvent::GroupLeave { group_id: "choir".into() })
            .await
            .is_none());
        assert!(!router.rooms().is_subscribed("bob", "choir"));
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let router = router_with(InMemoryStore::new());
        let (alice, mut rx) = connect(&router, "alice").await;
        drain(&mut rx);

        assert!(router
            .route(alice, ClientEvent::Ping { timestamp: Some(42) })
            .await
            .is_none());
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerEvent::Pong { timestamp: Some(42) }]
        ));
    }

    #[tokio::test]
    async fn test_supersession_and_stale_disconnect() {
        let store = InMemoryStore::new();
        store.add_friendship("alice", "bob");
        let router = router_with(store);
        let (_, mut bob_rx) = connect(&router, "bob").await;
        let (first, _first_rx) = connect(&router, "alice").await;
        drain(&mut bob_rx);

        let (second, _second_rx) = connect(&router, "alice").await;
        let names: Vec<&str> = drain(&mut bob_rx).iter().map(ServerEvent::name).collect();
        assert_eq!(names, vec!["presence:offline", "presence:online"]);

        // The superseded transport's cleanup changes nothing.
        router.disconnect(first).await;
        assert!(drain(&mut bob_rx).is_empty());
        assert!(router.registry().is_online("alice"));

        router.disconnect(second).await;
        assert!(matches!(
            drain(&mut bob_rx).as_slice(),
            [ServerEvent::PresenceOffline { user_id, .. }] if user_id == "alice"
        ));
    }

    #[tokio::test]
    async fn test_disconnect_cascade() {
        let store = InMemoryStore::new();
        store.set_group("choir", ["alice", "bob"]);
        let router = router_with(store);
        let (alice, mut alice_rx) = connect(&router, "alice").await;
        let (bob, mut bob_rx) = connect(&router, "bob").await;

        router
            .route(bob, ClientEvent::GroupJoin { group_id: "choir".into() })
            .await;
        assert!(router
            .route(
                alice,
                ClientEvent::CallInitiate {
                    receiver_id: "bob".into(),
                    offer: json!({ "sdp": "v=0" }),
                },
            )
            .await
            .is_none());
        assert!(router
            .route(
                bob,
                ClientEvent::CallAnswer {
                    caller_id: "alice".into(),
                    answer: json!({ "sdp": "v=0" }),
                },
            )
            .await
            .is_none());
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        router.disconnect(bob).await;

        assert!(router.rooms().groups_of("bob").is_empty());
        assert!(!router.calls().is_busy("alice"));
        assert!(drain(&mut alice_rx).iter().any(|e| matches!(
            e,
            ServerEvent::CallEnded { reason: CallEndReason::PeerDisconnected, .. }
        )));
    }

    #[tokio::test]
    async fn test_initiate_acknowledges_caller() {
        let router = router_with(InMemoryStore::new());
        let (alice, mut alice_rx) = connect(&router, "alice").await;
        let (_, mut bob_rx) = connect(&router, "bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let initiate = ClientEvent::CallInitiate {
            receiver_id: "bob".into(),
            offer: json!({ "sdp": "v=0" }),
        };
        assert!(router.route(alice, initiate).await.is_none());

        let call_id = match drain(&mut alice_rx).as_slice() {
            [ServerEvent::CallRinging { call_id, callee_id }] => {
                assert_eq!(callee_id, "bob");
                call_id.clone()
            }
            other => panic!("unexpected events {other:?}"),
        };
        assert!(matches!(
            drain(&mut bob_rx).as_slice(),
            [ServerEvent::CallIncoming { call_id: incoming, .. }] if *incoming == call_id
        ));

        assert!(router.calls().get_call(&call_id).is_ok());
        assert!(router.calls().is_busy("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_idle_state() {
        let router = router_with(InMemoryStore::new());
        let (alice, _alice_rx) = connect(&router, "alice").await;
        let (_, _bob_rx) = connect(&router, "bob").await;

        assert!(router.route(alice, send_to("bob", "Hello")).await.is_none());
        let call = router
            .calls()
            .create_call("alice", Default::default())
            .await
            .unwrap()
            .call;
        router.calls().end_call(&call.id, "alice").await.unwrap();

        router.sweep();
        assert_eq!(router.conversations().open_count(), 1);

        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
        router.sweep();
        assert_eq!(router.conversations().open_count(), 0);
        assert!(matches!(
            router.calls().get_call(&call.id),
            Err(RealtimeError::CallNotFound(_))
        ));

        // Sequence numbers continue from the store after eviction.
        assert!(router.route(alice, send_to("bob", "Again")).await.is_none());
        let key = crate::conversation::ConversationKey::direct("alice", "bob");
        assert_eq!(router.conversations().history(&key).await[0].seq, 2);
    }

    #[tokio::test]
    async fn test_media_state_requires_membership() {
        let router = router_with(InMemoryStore::new());
        let (alice, _alice_rx) = connect(&router, "alice").await;
        let (bob, _bob_rx) = connect(&router, "bob").await;
        let call = router
            .calls()
            .create_call("alice", Default::default())
            .await
            .unwrap()
            .call;

        let mute = |call_id: &str| ClientEvent::CallMediaState {
            call_id: call_id.into(),
            patch: MediaStatePatch {
                is_muted: Some(true),
                ..Default::default()
            },
        };
        assert!(router.route(alice, mute(&call.id)).await.is_none());
        assert!(matches!(
            router.route(bob, mute(&call.id)).await,
            Some(ServerEvent::Error { code: ErrorCode::Forbidden, .. })
        ));
        assert!(matches!(
            router.route(bob, mute("call_gone")).await,
            Some(ServerEvent::Error { code: ErrorCode::CallNotFound, .. })
        ));
    }
}
