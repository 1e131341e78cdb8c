//! Conversation delivery.
//!
//! Orders and delivers direct and group messages, typing indicators,
//! reactions, deletions, and read receipts, and keeps per-conversation
//! unread counters.
//!
//! Every conversation has its own async mutex. An operation holds it from
//! the moment it reads conversation state until its fan-out is queued, so
//! all participants observe one conversation's events in acceptance order
//! while unrelated conversations proceed independently.
//!
//! Only a window of recent messages stays in memory; the store is the
//! record. Older messages are loaded on demand for reactions and deletes,
//! and idle conversations are dropped by [`ConversationService::evict_idle`].

use crate::conversation::{Conversation, ConversationKey};
use crate::error::RealtimeError;
use crate::ids::{generate_message_id, now_millis};
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomDirectory;
use crate::store::Store;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use vigil_protocol::{
    ChatMessage, MessageId, MessageStatus, Reaction, ServerEvent, UserId,
    TYPING_INDICATOR_TTL_MS,
};

/// Messages kept in memory per conversation.
pub const DEFAULT_RETAINED_MESSAGES: usize = 500;

/// Result of toggling a reaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionChange {
    /// The user had no reaction; this one was added.
    Added(Reaction),
    /// The user reacted with the same emoji again; it was removed.
    Removed(Reaction),
    /// The user's previous reaction was replaced.
    Replaced { removed: Reaction, added: Reaction },
}

#[derive(Debug, Clone, Copy)]
struct TypingState {
    is_typing: bool,
    updated_at: u64,
}

#[derive(Debug)]
struct ConversationState {
    conversation: Conversation,
    /// Most recent messages in acceptance order.
    messages: Vec<ChatMessage>,
    next_seq: u64,
    /// Whether `next_seq` has been read back from the store.
    seq_loaded: bool,
    unread: HashMap<UserId, u64>,
    typing: HashMap<UserId, TypingState>,
    last_active: Instant,
}

impl ConversationState {
    fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            messages: Vec::new(),
            next_seq: 1,
            seq_loaded: false,
            unread: HashMap::new(),
            typing: HashMap::new(),
            last_active: Instant::now(),
        }
    }

    fn position(&self, message_id: MessageId) -> Option<usize> {
        // Ids grow with acceptance order.
        self.messages
            .binary_search_by_key(&message_id, |m| m.id)
            .ok()
    }
}

/// The conversation delivery service.
pub struct ConversationService {
    conversations: DashMap<ConversationKey, Arc<Mutex<ConversationState>>>,
    /// Conversation owning each message.
    message_index: DashMap<MessageId, ConversationKey>,
    /// Conversation each user reports as open.
    viewing: DashMap<UserId, ConversationKey>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomDirectory>,
    store: Arc<dyn Store>,
    retained: usize,
}

impl ConversationService {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomDirectory>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            conversations: DashMap::new(),
            message_index: DashMap::new(),
            viewing: DashMap::new(),
            registry,
            rooms,
            store,
            retained: DEFAULT_RETAINED_MESSAGES,
        }
    }

    /// Keep at most `retained` messages per conversation in memory.
    #[must_use]
    pub fn with_retention(mut self, retained: usize) -> Self {
        self.retained = retained.max(1);
        self
    }

    fn state_for(&self, conversation: &Conversation) -> Arc<Mutex<ConversationState>> {
        self.conversations
            .entry(conversation.key().clone())
            .or_insert_with(|| {
                debug!(conversation = %conversation.key(), "Opening conversation");
                Arc::new(Mutex::new(ConversationState::new(conversation.clone())))
            })
            .clone()
    }

    fn existing(&self, key: &ConversationKey) -> Option<Arc<Mutex<ConversationState>>> {
        self.conversations.get(key).map(|s| Arc::clone(s.value()))
    }

    /// State of the conversation owning a message, rebuilt from the store
    /// when the message is no longer in memory.
    async fn state_of_message(
        &self,
        message_id: MessageId,
    ) -> Result<Arc<Mutex<ConversationState>>, RealtimeError> {
        let indexed = self
            .message_index
            .get(&message_id)
            .map(|k| k.value().clone())
            .and_then(|key| self.existing(&key));
        if let Some(state) = indexed {
            return Ok(state);
        }

        let stored = self
            .store
            .load_message(message_id)
            .await?
            .ok_or(RealtimeError::MessageNotFound(message_id))?;
        let conversation = Conversation::of_message(self.store.as_ref(), &stored).await?;
        Ok(self.state_for(&conversation))
    }

    /// The message as held in memory, or as stored if it left the window.
    async fn current(
        &self,
        state: &ConversationState,
        message_id: MessageId,
    ) -> Result<(Option<usize>, ChatMessage), RealtimeError> {
        if let Some(position) = state.position(message_id) {
            return Ok((Some(position), state.messages[position].clone()));
        }
        let stored = self
            .store
            .load_message(message_id)
            .await?
            .filter(|m| m.conversation_key == state.conversation.key().as_str())
            .ok_or(RealtimeError::MessageNotFound(message_id))?;
        Ok((None, stored))
    }

    /// Live audience of a conversation, optionally excluding one user.
    ///
    /// Direct conversations reach both participants; group conversations
    /// reach members currently subscribed to the group room.
    fn audience(&self, conversation: &Conversation, exclude: Option<&str>) -> Vec<UserId> {
        let candidates: Vec<UserId> = match conversation.group_id() {
            Some(group_id) => self
                .rooms
                .subscribers(group_id)
                .into_iter()
                .filter(|u| conversation.is_participant(u))
                .collect(),
            None => conversation.participants().iter().cloned().collect(),
        };
        candidates
            .into_iter()
            .filter(|u| Some(u.as_str()) != exclude)
            .collect()
    }

    fn is_viewing(&self, user_id: &str, key: &ConversationKey) -> bool {
        self.viewing
            .get(user_id)
            .map(|k| k.value() == key)
            .unwrap_or(false)
    }

    /// Accept a message and deliver it.
    ///
    /// The message is persisted before anything is committed in memory or
    /// fanned out; a persistence failure leaves no trace.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if the sender is not a participant, or
    /// `Persistence` if the store rejected the message.
    pub async fn send(
        &self,
        sender: &str,
        conversation: &Conversation,
        content: String,
    ) -> Result<ChatMessage, RealtimeError> {
        if !conversation.is_participant(sender) {
            return Err(RealtimeError::Forbidden(format!(
                "{sender} is not a participant of {}",
                conversation.key()
            )));
        }

        let state = self.state_for(conversation);
        let mut state = state.lock().await;
        // Group membership may have changed since the state was created.
        state.conversation = conversation.clone();
        state.last_active = Instant::now();
        if !state.seq_loaded {
            state.next_seq = self.store.last_seq(conversation.key().as_str()).await? + 1;
            state.seq_loaded = true;
        }

        let mut message = ChatMessage {
            id: generate_message_id(),
            seq: state.next_seq,
            conversation_key: conversation.key().to_string(),
            sender_id: sender.to_string(),
            content,
            created_at: now_millis(),
            status: MessageStatus::Sent,
            is_deleted: false,
            reactions: Vec::new(),
        };

        self.store.insert_message(&message).await?;

        state.next_seq += 1;
        self.message_index
            .insert(message.id, conversation.key().clone());

        let recipients = self.audience(conversation, Some(sender));
        let viewers: Vec<UserId> = recipients
            .iter()
            .filter(|r| self.is_viewing(r, conversation.key()))
            .cloned()
            .collect();

        for participant in conversation.others(sender) {
            if !viewers.contains(participant) {
                *state.unread.entry(participant.clone()).or_insert(0) += 1;
            }
        }
        state.typing.remove(sender);

        for recipient in &recipients {
            let unread_count = state.unread.get(recipient).copied().unwrap_or(0);
            self.registry.deliver(
                recipient,
                Arc::new(ServerEvent::MessageNew {
                    message: message.clone(),
                    unread_count,
                }),
            );
        }
        self.registry.deliver(
            sender,
            Arc::new(ServerEvent::MessageSent {
                message: message.clone(),
            }),
        );

        if !viewers.is_empty() {
            message.status = MessageStatus::Delivered;
            if let Err(e) = self.store.update_message(&message).await {
                warn!(message = message.id, error = %e, "Failed to persist delivered status");
            }
            for viewer in &viewers {
                let event = ServerEvent::MessageDelivered {
                    message_id: message.id,
                    conversation_key: message.conversation_key.clone(),
                    recipient_id: viewer.clone(),
                };
                self.registry
                    .fanout([sender.to_string(), viewer.clone()].iter(), event);
            }
        }

        debug!(
            conversation = %conversation.key(),
            message = message.id,
            seq = message.seq,
            recipients = recipients.len(),
            "Message accepted"
        );

        state.messages.push(message.clone());
        let overflow = state.messages.len().saturating_sub(self.retained);
        for old in state.messages.drain(..overflow) {
            self.message_index.remove(&old.id);
        }
        Ok(message)
    }

    /// Mark every unread message from other participants as read.
    ///
    /// Returns the ids that changed. Calling it again with no new messages,
    /// or on a conversation nothing was sent to, returns an empty list and
    /// emits nothing.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for non-participants, or `Persistence`.
    pub async fn mark_read(
        &self,
        reader: &str,
        conversation: &Conversation,
    ) -> Result<Vec<MessageId>, RealtimeError> {
        let key = conversation.key();
        if !conversation.is_participant(reader) {
            return Err(RealtimeError::Forbidden(format!(
                "{reader} is not a participant of {key}"
            )));
        }
        let Some(state) = self.existing(key) else {
            debug!(conversation = %key, reader = %reader, "Nothing to read");
            return Ok(Vec::new());
        };
        let mut state = state.lock().await;
        state.last_active = Instant::now();

        let unread: Vec<MessageId> = state
            .messages
            .iter()
            .filter(|m| m.sender_id != reader && m.status != MessageStatus::Read)
            .map(|m| m.id)
            .collect();

        if unread.is_empty() {
            state.unread.insert(reader.to_string(), 0);
            return Ok(unread);
        }

        self.store.mark_read(key.as_str(), &unread, reader).await?;

        for message in state
            .messages
            .iter_mut()
            .filter(|m| m.sender_id != reader && m.status != MessageStatus::Read)
        {
            message.status = MessageStatus::Read;
        }
        state.unread.insert(reader.to_string(), 0);

        let targets = self.audience(&state.conversation, Some(reader));
        self.registry.fanout(
            &targets,
            ServerEvent::MessagesRead {
                conversation_key: key.to_string(),
                reader_id: reader.to_string(),
                message_ids: unread.clone(),
                read_at: now_millis(),
            },
        );

        debug!(conversation = %key, reader = %reader, count = unread.len(), "Messages read");
        Ok(unread)
    }

    /// Toggle a reaction.
    ///
    /// The same emoji again removes the user's reaction; a different emoji
    /// replaces it. A user holds at most one reaction per message.
    ///
    /// # Errors
    ///
    /// Returns `MessageNotFound`, `Forbidden` for non-participants, or
    /// `Persistence`.
    pub async fn react(
        &self,
        user_id: &str,
        message_id: MessageId,
        reaction: &str,
    ) -> Result<ReactionChange, RealtimeError> {
        let state = self.state_of_message(message_id).await?;
        let mut state = state.lock().await;

        if !state.conversation.is_participant(user_id) {
            return Err(RealtimeError::Forbidden(format!(
                "{user_id} is not a participant of {}",
                state.conversation.key()
            )));
        }
        let (position, mut updated) = self.current(&state, message_id).await?;
        let previous = updated
            .reactions
            .iter()
            .position(|r| r.user_id == user_id)
            .map(|i| updated.reactions.remove(i));

        let change = match previous {
            Some(removed) if removed.reaction == reaction => ReactionChange::Removed(removed),
            previous => {
                let added = Reaction {
                    user_id: user_id.to_string(),
                    reaction: reaction.to_string(),
                    added_at: now_millis(),
                };
                updated.reactions.push(added.clone());
                match previous {
                    Some(removed) => ReactionChange::Replaced { removed, added },
                    None => ReactionChange::Added(added),
                }
            }
        };

        self.store.update_message(&updated).await?;
        if let Some(position) = position {
            state.messages[position] = updated;
        }
        state.last_active = Instant::now();

        let targets = self.audience(&state.conversation, None);
        let conversation_key = state.conversation.key().to_string();
        let removed = match &change {
            ReactionChange::Removed(r) | ReactionChange::Replaced { removed: r, .. } => Some(r),
            ReactionChange::Added(_) => None,
        };
        if let Some(removed) = removed {
            self.registry.fanout(
                &targets,
                ServerEvent::MessageReactionRemoved {
                    message_id,
                    conversation_key: conversation_key.clone(),
                    user_id: user_id.to_string(),
                    reaction: removed.reaction.clone(),
                },
            );
        }
        if let ReactionChange::Added(added) | ReactionChange::Replaced { added, .. } = &change {
            self.registry.fanout(
                &targets,
                ServerEvent::MessageReactionAdded {
                    message_id,
                    conversation_key,
                    user_id: user_id.to_string(),
                    reaction: added.reaction.clone(),
                    added_at: added.added_at,
                },
            );
        }

        Ok(change)
    }

    /// Tombstone a message. Only its sender may delete it.
    ///
    /// Returns `false` if the message was already deleted.
    ///
    /// # Errors
    ///
    /// Returns `MessageNotFound`, `Forbidden` for anyone but the sender, or
    /// `Persistence`.
    pub async fn delete(&self, user_id: &str, message_id: MessageId) -> Result<bool, RealtimeError> {
        let state = self.state_of_message(message_id).await?;
        let mut state = state.lock().await;

        let (position, message) = self.current(&state, message_id).await?;

        if message.sender_id != user_id {
            return Err(RealtimeError::Forbidden(
                "only the sender may delete a message".to_string(),
            ));
        }
        if message.is_deleted {
            return Ok(false);
        }

        let mut updated = message;
        updated.is_deleted = true;
        self.store.update_message(&updated).await?;
        if let Some(position) = position {
            state.messages[position] = updated;
        }
        state.last_active = Instant::now();

        let targets = self.audience(&state.conversation, None);
        self.registry.fanout(
            &targets,
            ServerEvent::MessageDeleted {
                message_id,
                conversation_key: state.conversation.key().to_string(),
                deleted_by: user_id.to_string(),
            },
        );

        debug!(conversation = %state.conversation.key(), message = message_id, "Message deleted");
        Ok(true)
    }

    /// Record a typing indicator and relay it to the other participants.
    ///
    /// No expiry timer runs on the server: clients drop the indicator after
    /// [`TYPING_INDICATOR_TTL_MS`] without a refresh.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for non-participants.
    pub async fn set_typing(
        &self,
        user_id: &str,
        conversation: &Conversation,
        is_typing: bool,
    ) -> Result<(), RealtimeError> {
        if !conversation.is_participant(user_id) {
            return Err(RealtimeError::Forbidden(format!(
                "{user_id} is not a participant of {}",
                conversation.key()
            )));
        }

        let state = self.state_for(conversation);
        let mut state = state.lock().await;
        state.last_active = Instant::now();
        state.typing.insert(
            user_id.to_string(),
            TypingState {
                is_typing,
                updated_at: now_millis(),
            },
        );

        let targets = self.audience(conversation, Some(user_id));
        self.registry.fanout(
            &targets,
            ServerEvent::UserTyping {
                conversation_key: conversation.key().to_string(),
                user_id: user_id.to_string(),
                is_typing,
                ttl_ms: TYPING_INDICATOR_TTL_MS,
            },
        );
        Ok(())
    }

    /// Last reported typing state and when it was reported.
    pub async fn typing_state(&self, key: &ConversationKey, user_id: &str) -> Option<(bool, u64)> {
        let state = self.existing(key)?;
        let state = state.lock().await;
        state
            .typing
            .get(user_id)
            .map(|t| (t.is_typing, t.updated_at))
    }

    /// Record which conversation a user has open (`None` to clear).
    pub fn set_active(&self, user_id: &str, key: Option<ConversationKey>) {
        match key {
            Some(key) => {
                self.viewing.insert(user_id.to_string(), key);
            }
            None => {
                self.viewing.remove(user_id);
            }
        }
    }

    /// Forget a user's open conversation (on disconnect).
    pub fn forget_viewer(&self, user_id: &str) {
        self.viewing.remove(user_id);
    }

    /// A user's unread count in a conversation.
    pub async fn unread_count(&self, user_id: &str, key: &ConversationKey) -> u64 {
        match self.existing(key) {
            Some(state) => state.lock().await.unread.get(user_id).copied().unwrap_or(0),
            None => 0,
        }
    }

    /// The in-memory window of a conversation, in acceptance order.
    pub async fn history(&self, key: &ConversationKey) -> Vec<ChatMessage> {
        match self.existing(key) {
            Some(state) => state.lock().await.messages.clone(),
            None => Vec::new(),
        }
    }

    /// Number of conversations held in memory.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.conversations.len()
    }

    /// Drop conversations untouched for `idle`. Their messages stay in the
    /// store; unread counters and typing state go with them. Conversations
    /// locked by an in-flight operation are kept.
    ///
    /// Returns how many conversations were dropped.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let mut released = Vec::new();
        let before = self.conversations.len();
        self.conversations.retain(|_, state| {
            let Ok(state) = state.try_lock() else {
                return true;
            };
            if state.last_active.elapsed() < idle {
                return true;
            }
            released.extend(state.messages.iter().map(|m| m.id));
            false
        });
        for id in released {
            self.message_index.remove(&id);
        }

        let evicted = before.saturating_sub(self.conversations.len());
        if evicted > 0 {
            debug!(evicted, "Evicted idle conversations");
        }
        evicted
    }
}
