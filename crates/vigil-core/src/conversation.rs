//! Conversation identity and membership.

use crate::error::RealtimeError;
use crate::store::Store;
use std::collections::BTreeSet;
use std::fmt;
use vigil_protocol::{ChatMessage, ConversationTarget, GroupId, UserId};

/// Deterministic identifier of a conversation.
///
/// Direct conversations are keyed `dm:<lo>:<hi>` over the sorted pair of
/// participants; group conversations are keyed `group:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey(String);

impl ConversationKey {
    /// Key of the direct conversation between two users, in either order.
    #[must_use]
    pub fn direct(a: &str, b: &str) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("dm:{lo}:{hi}"))
    }

    /// Key of a group conversation.
    #[must_use]
    pub fn group(group_id: &str) -> Self {
        Self(format!("group:{group_id}"))
    }

    /// The key as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Direct or group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationKind {
    Direct,
    Group(GroupId),
}

/// A conversation with its resolved participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    key: ConversationKey,
    kind: ConversationKind,
    participants: BTreeSet<UserId>,
}

impl Conversation {
    /// The direct conversation between two users.
    #[must_use]
    pub fn direct(a: &str, b: &str) -> Self {
        Self {
            key: ConversationKey::direct(a, b),
            kind: ConversationKind::Direct,
            participants: [a.to_string(), b.to_string()].into_iter().collect(),
        }
    }

    /// A group conversation with its current members.
    #[must_use]
    pub fn group<I, S>(group_id: &str, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        Self {
            key: ConversationKey::group(group_id),
            kind: ConversationKind::Group(group_id.to_string()),
            participants: members.into_iter().map(Into::into).collect(),
        }
    }

    /// Resolve the conversation an event addresses and check that the
    /// sender belongs to it.
    ///
    /// # Errors
    ///
    /// - `InvalidEvent` when a user addresses themselves
    /// - `Forbidden` when the directory denies contact or membership
    /// - `ConversationNotFound` for unknown groups
    /// - `Persistence` when the directory is unavailable
    pub async fn resolve(
        store: &dyn Store,
        sender: &str,
        target: &ConversationTarget,
    ) -> Result<Self, RealtimeError> {
        match target {
            ConversationTarget::Direct(receiver) => {
                if receiver == sender {
                    return Err(RealtimeError::InvalidEvent(
                        "cannot address a conversation with yourself".to_string(),
                    ));
                }
                if !store.can_contact(sender, receiver).await? {
                    return Err(RealtimeError::Forbidden(format!(
                        "{sender} may not contact {receiver}"
                    )));
                }
                Ok(Self::direct(sender, receiver))
            }
            ConversationTarget::Group(group_id) => {
                let members = store
                    .group_members(group_id)
                    .await?
                    .ok_or_else(|| RealtimeError::ConversationNotFound(group_id.clone()))?;
                let conversation = Self::group(group_id, members);
                if !conversation.is_participant(sender) {
                    return Err(RealtimeError::Forbidden(format!(
                        "{sender} is not a member of group {group_id}"
                    )));
                }
                Ok(conversation)
            }
        }
    }

    /// The conversation a stored message belongs to, rebuilt from its key
    /// and sender.
    ///
    /// # Errors
    ///
    /// Returns `ConversationNotFound` for an unrecognised key or a group
    /// that no longer exists, or `Persistence`.
    pub async fn of_message(store: &dyn Store, message: &ChatMessage) -> Result<Self, RealtimeError> {
        let key = message.conversation_key.as_str();
        let not_found = || RealtimeError::ConversationNotFound(key.to_string());

        if let Some(group_id) = key.strip_prefix("group:") {
            let members = store.group_members(group_id).await?.ok_or_else(not_found)?;
            return Ok(Self::group(group_id, members));
        }

        let sender = message.sender_id.as_str();
        let pair = key.strip_prefix("dm:").ok_or_else(not_found)?;
        let peer = pair
            .strip_prefix(sender)
            .and_then(|rest| rest.strip_prefix(':'))
            .or_else(|| pair.strip_suffix(sender).and_then(|rest| rest.strip_suffix(':')))
            .ok_or_else(not_found)?;
        let conversation = Self::direct(sender, peer);
        if conversation.key().as_str() != key {
            return Err(not_found());
        }
        Ok(conversation)
    }

    #[must_use]
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    #[must_use]
    pub fn kind(&self) -> &ConversationKind {
        &self.kind
    }

    /// The group id, for group conversations.
    #[must_use]
    pub fn group_id(&self) -> Option<&str> {
        match &self.kind {
            ConversationKind::Group(id) => Some(id),
            ConversationKind::Direct => None,
        }
    }

    #[must_use]
    pub fn participants(&self) -> &BTreeSet<UserId> {
        &self.participants
    }

    #[must_use]
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participants.contains(user_id)
    }

    /// Every participant except `user_id`.
    pub fn others<'a>(&'a self, user_id: &'a str) -> impl Iterator<Item = &'a UserId> + 'a {
        self.participants.iter().filter(move |p| p.as_str() != user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn test_direct_key_is_order_independent() {
        assert_eq!(
            ConversationKey::direct("bob", "alice"),
            ConversationKey::direct("alice", "bob")
        );
        assert_eq!(ConversationKey::direct("bob", "alice").as_str(), "dm:alice:bob");
        assert_eq!(ConversationKey::group("choir").as_str(), "group:choir");
    }

    #[test]
    fn test_others_excludes_self() {
        let conversation = Conversation::group("choir", ["alice", "bob", "carol"]);
        let others: Vec<&UserId> = conversation.others("bob").collect();
        assert_eq!(others, vec!["alice", "carol"]);
    }

    #[tokio::test]
    async fn test_resolve_direct() {
        let store = InMemoryStore::new();
        store.block("carol", "alice");

        let conversation = Conversation::resolve(
            &store,
            "alice",
            &ConversationTarget::Direct("bob".into()),
        )
        .await
        .unwrap();
        assert_eq!(conversation.key().as_str(), "dm:alice:bob");

        assert!(matches!(
            Conversation::resolve(&store, "alice", &ConversationTarget::Direct("carol".into()))
                .await,
            Err(RealtimeError::Forbidden(_))
        ));
        assert!(matches!(
            Conversation::resolve(&store, "alice", &ConversationTarget::Direct("alice".into()))
                .await,
            Err(RealtimeError::InvalidEvent(_))
        ));
    }

    fn stored(key: &str, sender: &str) -> ChatMessage {
        ChatMessage {
            id: 1,
            seq: 1,
            conversation_key: key.into(),
            sender_id: sender.into(),
            content: "hi".into(),
            created_at: 0,
            status: vigil_protocol::MessageStatus::Sent,
            is_deleted: false,
            reactions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_of_message() {
        let store = InMemoryStore::new();
        store.set_group("choir", ["alice", "bob"]);

        let direct = Conversation::of_message(&store, &stored("dm:alice:bob", "bob"))
            .await
            .unwrap();
        assert_eq!(direct, Conversation::direct("alice", "bob"));

        let with_colon = Conversation::of_message(&store, &stored("dm:a:b:c", "a:b"))
            .await
            .unwrap();
        assert!(with_colon.is_participant("c"));

        let group = Conversation::of_message(&store, &stored("group:choir", "alice"))
            .await
            .unwrap();
        assert!(group.is_participant("bob"));

        for (key, sender) in [("dm:alice:bob", "carol"), ("group:band", "alice"), ("room:1", "alice")] {
            assert!(matches!(
                Conversation::of_message(&store, &stored(key, sender)).await,
                Err(RealtimeError::ConversationNotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_resolve_group_membership() {
        let store = InMemoryStore::new();
        store.set_group("choir", ["alice", "bob"]);

        let conversation =
            Conversation::resolve(&store, "bob", &ConversationTarget::Group("choir".into()))
                .await
                .unwrap();
        assert_eq!(conversation.group_id(), Some("choir"));

        assert!(matches!(
            Conversation::resolve(&store, "mallory", &ConversationTarget::Group("choir".into()))
                .await,
            Err(RealtimeError::Forbidden(_))
        ));
        assert!(matches!(
            Conversation::resolve(&store, "bob", &ConversationTarget::Group("band".into())).await,
            Err(RealtimeError::ConversationNotFound(_))
        ));
    }
}
