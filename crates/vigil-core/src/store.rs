//! External collaborators: directory lookups, persistence, and RTC tokens.
//!
//! The realtime core does not own durable state. Relationship and group
//! membership lookups, message and call records, and RTC token minting all
//! go through these traits. [`InMemoryStore`] backs tests and single-node
//! development deployments.

use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;
use vigil_protocol::{CallSummary, ChatMessage, GroupId, MessageId, MessageStatus, UserId};

/// Relationship, membership, and persistence operations the core relies on.
#[async_trait]
pub trait Store: Send + Sync {
    /// Identities interested in this user's presence (accepted friends).
    async fn friends_of(&self, user_id: &str) -> Result<Vec<UserId>, StoreError>;

    /// Whether `from` may message or call `to` directly.
    async fn can_contact(&self, from: &str, to: &str) -> Result<bool, StoreError>;

    /// Members of a group, or `None` if the group does not exist.
    async fn group_members(&self, group_id: &str) -> Result<Option<Vec<UserId>>, StoreError>;

    /// Persist a newly accepted message.
    async fn insert_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// Persist a changed message (status, reactions, tombstone).
    async fn update_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// A stored message, or `None` if it was never accepted.
    async fn load_message(&self, message_id: MessageId) -> Result<Option<ChatMessage>, StoreError>;

    /// Highest sequence number stored for a conversation, 0 if it has none.
    async fn last_seq(&self, conversation_key: &str) -> Result<u64, StoreError>;

    /// Persist read receipts for a batch of messages.
    async fn mark_read(
        &self,
        conversation_key: &str,
        message_ids: &[MessageId],
        reader_id: &str,
    ) -> Result<(), StoreError>;

    /// Persist call session metadata.
    async fn save_call(&self, call: &CallSummary) -> Result<(), StoreError>;
}

/// What an RTC token grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcGrant<'a> {
    pub app_id: &'a str,
    pub channel_name: &'a str,
    pub uid: u32,
    pub user_id: &'a str,
}

/// Mints tokens for the third-party RTC network.
#[async_trait]
pub trait RtcTokenIssuer: Send + Sync {
    /// Mint a token that lets `grant.uid` join `grant.channel_name`.
    async fn issue(&self, grant: RtcGrant<'_>) -> Result<String, StoreError>;
}

/// Issuer for networks running without token authentication.
///
/// The token is an unsigned descriptor of the grant.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsignedTokenIssuer;

#[async_trait]
impl RtcTokenIssuer for UnsignedTokenIssuer {
    async fn issue(&self, grant: RtcGrant<'_>) -> Result<String, StoreError> {
        Ok(format!(
            "{}:{}:{}",
            grant.app_id, grant.channel_name, grant.uid
        ))
    }
}

/// In-memory [`Store`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    friends: DashMap<UserId, BTreeSet<UserId>>,
    blocked: DashSet<(UserId, UserId)>,
    groups: DashMap<GroupId, BTreeSet<UserId>>,
    messages: DashMap<MessageId, ChatMessage>,
    calls: DashMap<String, CallSummary>,
    fail_writes: AtomicBool,
    write_delay: Option<Duration>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every write, simulating a round trip to a remote store.
    #[must_use]
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Record an accepted friendship in both directions.
    pub fn add_friendship(&self, a: &str, b: &str) {
        self.friends
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        self.friends
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
    }

    /// Prevent `blocker` and `blocked` from contacting each other.
    pub fn block(&self, blocker: &str, blocked: &str) {
        self.blocked
            .insert((blocker.to_string(), blocked.to_string()));
    }

    /// Create or replace a group.
    pub fn set_group<I, S>(&self, group_id: &str, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        self.groups.insert(
            group_id.to_string(),
            members.into_iter().map(Into::into).collect(),
        );
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// A persisted message.
    #[must_use]
    pub fn message(&self, id: MessageId) -> Option<ChatMessage> {
        self.messages.get(&id).map(|m| m.value().clone())
    }

    /// Number of persisted messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// A persisted call.
    #[must_use]
    pub fn call(&self, call_id: &str) -> Option<CallSummary> {
        self.calls.get(call_id).map(|c| c.value().clone())
    }

    async fn write(&self) -> Result<(), StoreError> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn friends_of(&self, user_id: &str) -> Result<Vec<UserId>, StoreError> {
        Ok(self
            .friends
            .get(user_id)
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn can_contact(&self, from: &str, to: &str) -> Result<bool, StoreError> {
        let blocked = self
            .blocked
            .contains(&(from.to_string(), to.to_string()))
            || self.blocked.contains(&(to.to_string(), from.to_string()));
        Ok(!blocked)
    }

    async fn group_members(&self, group_id: &str) -> Result<Option<Vec<UserId>>, StoreError> {
        Ok(self
            .groups
            .get(group_id)
            .map(|m| m.iter().cloned().collect()))
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.write().await?;
        self.messages.insert(message.id, message.clone());
        debug!(message = message.id, "Stored message");
        Ok(())
    }

    async fn update_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.write().await?;
        match self.messages.get_mut(&message.id) {
            Some(mut stored) => {
                *stored = message.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("message {}", message.id))),
        }
    }

    async fn load_message(&self, message_id: MessageId) -> Result<Option<ChatMessage>, StoreError> {
        Ok(self.message(message_id))
    }

    async fn last_seq(&self, conversation_key: &str) -> Result<u64, StoreError> {
        Ok(self
            .messages
            .iter()
            .filter(|m| m.conversation_key == conversation_key)
            .map(|m| m.seq)
            .max()
            .unwrap_or(0))
    }

    async fn mark_read(
        &self,
        _conversation_key: &str,
        message_ids: &[MessageId],
        _reader_id: &str,
    ) -> Result<(), StoreError> {
        self.write().await?;
        for id in message_ids {
            if let Some(mut stored) = self.messages.get_mut(id) {
                stored.status = MessageStatus::Read;
            }
        }
        Ok(())
    }

    async fn save_call(&self, call: &CallSummary) -> Result<(), StoreError> {
        self.write().await?;
        self.calls.insert(call.id.clone(), call.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_friendship_is_symmetric() {
        let store = InMemoryStore::new();
        store.add_friendship("alice", "bob");

        assert_eq!(store.friends_of("alice").await.unwrap(), vec!["bob"]);
        assert_eq!(store.friends_of("bob").await.unwrap(), vec!["alice"]);
        assert!(store.friends_of("carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_block_applies_both_ways() {
        let store = InMemoryStore::new();
        store.block("alice", "bob");

        assert!(!store.can_contact("alice", "bob").await.unwrap());
        assert!(!store.can_contact("bob", "alice").await.unwrap());
        assert!(store.can_contact("alice", "carol").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_writes() {
        let store = InMemoryStore::new();
        store.set_fail_writes(true);

        let message = ChatMessage {
            id: 1,
            seq: 1,
            conversation_key: "dm:alice:bob".into(),
            sender_id: "alice".into(),
            content: "hi".into(),
            created_at: 0,
            status: MessageStatus::Sent,
            is_deleted: false,
            reactions: Vec::new(),
        };
        assert!(store.insert_message(&message).await.is_err());
        assert_eq!(store.message_count(), 0);

        store.set_fail_writes(false);
        store.insert_message(&message).await.unwrap();
        assert_eq!(store.message(1), Some(message));
    }

    #[tokio::test]
    async fn test_last_seq_per_conversation() {
        let store = InMemoryStore::new();
        assert_eq!(store.last_seq("dm:alice:bob").await.unwrap(), 0);

        for (id, seq, key) in [(1, 1, "dm:alice:bob"), (2, 2, "dm:alice:bob"), (3, 7, "group:choir")] {
            let message = ChatMessage {
                id,
                seq,
                conversation_key: key.into(),
                sender_id: "alice".into(),
                content: "hi".into(),
                created_at: 0,
                status: MessageStatus::Sent,
                is_deleted: false,
                reactions: Vec::new(),
            };
            store.insert_message(&message).await.unwrap();
        }

        assert_eq!(store.last_seq("dm:alice:bob").await.unwrap(), 2);
        assert_eq!(store.last_seq("group:choir").await.unwrap(), 7);
        assert_eq!(store.load_message(3).await.unwrap().unwrap().seq, 7);
        assert!(store.load_message(4).await.unwrap().is_none());
    }
}
