//! Event types for the Vigil protocol.
//!
//! Every event travels as `{"event": "<name>", "data": {...}}`. Inbound
//! events are [`ClientEvent`]s, outbound events are [`ServerEvent`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{
    CallEndReason, CallId, ChatMessage, GroupId, MediaStatePatch, MessageId, ParticipantInfo,
    UserId,
};

/// Maximum message content length in characters.
pub const MAX_CONTENT_LENGTH: usize = 10_000;

/// Maximum reaction length in bytes (a handful of emoji code points).
pub const MAX_REACTION_LENGTH: usize = 32;

/// Maximum identifier length.
pub const MAX_ID_LENGTH: usize = 128;

/// How long a `user:typing` indicator stays valid without a refresh.
///
/// The server never expires typing state on its own; clients hide the
/// indicator once this window passes without another `user:typing`.
pub const TYPING_INDICATOR_TTL_MS: u64 = 1_000;

/// Reason a client event failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub &'static str);

/// Stable numeric error codes carried by the `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    InvalidEvent = 1001,
    Unauthenticated = 1002,
    Unauthorized = 1003,
    Forbidden = 1004,
    CallFull = 2001,
    CallEnded = 2002,
    CallNotFound = 2003,
    CallBusy = 2004,
    MessageNotFound = 3001,
    ConversationNotFound = 3002,
    TargetUnreachable = 3003,
    Internal = 5000,
    PersistenceFailed = 5001,
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = &'static str;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1001 => Ok(ErrorCode::InvalidEvent),
            1002 => Ok(ErrorCode::Unauthenticated),
            1003 => Ok(ErrorCode::Unauthorized),
            1004 => Ok(ErrorCode::Forbidden),
            2001 => Ok(ErrorCode::CallFull),
            2002 => Ok(ErrorCode::CallEnded),
            2003 => Ok(ErrorCode::CallNotFound),
            2004 => Ok(ErrorCode::CallBusy),
            3001 => Ok(ErrorCode::MessageNotFound),
            3002 => Ok(ErrorCode::ConversationNotFound),
            3003 => Ok(ErrorCode::TargetUnreachable),
            5000 => Ok(ErrorCode::Internal),
            5001 => Ok(ErrorCode::PersistenceFailed),
            _ => Err("Invalid error code"),
        }
    }
}

/// The conversation an inbound event addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationTarget {
    /// Direct conversation with another user.
    Direct(UserId),
    /// Group conversation.
    Group(GroupId),
}

/// Resolve `{receiverId | groupId}` to exactly one target.
fn target_of(
    receiver_id: &Option<UserId>,
    group_id: &Option<GroupId>,
) -> Result<ConversationTarget, ValidationError> {
    match (receiver_id, group_id) {
        (Some(receiver), None) => {
            validate_id(receiver)?;
            Ok(ConversationTarget::Direct(receiver.clone()))
        }
        (None, Some(group)) => {
            validate_id(group)?;
            Ok(ConversationTarget::Group(group.clone()))
        }
        (Some(_), Some(_)) => Err(ValidationError("receiverId and groupId are exclusive")),
        (None, None) => Err(ValidationError("receiverId or groupId is required")),
    }
}

/// Validate an identifier field.
///
/// # Errors
///
/// Returns an error if the identifier is empty, too long, or contains
/// control characters.
pub fn validate_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError("Identifier cannot be empty"));
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(ValidationError("Identifier too long"));
    }
    if id.chars().any(char::is_control) {
        return Err(ValidationError("Identifier contains invalid characters"));
    }
    Ok(())
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Announce presence on an already authenticated connection.
    #[serde(rename = "user:online")]
    UserOnline,

    /// Send a chat message.
    #[serde(rename = "message:send", rename_all = "camelCase")]
    MessageSend {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
        content: String,
    },

    /// Start or stop typing.
    #[serde(rename = "message:typing", rename_all = "camelCase")]
    MessageTyping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
        is_typing: bool,
    },

    /// Toggle a reaction on a message.
    #[serde(rename = "message:react", rename_all = "camelCase")]
    MessageReact {
        message_id: MessageId,
        reaction: String,
    },

    /// Tombstone one of the sender's own messages.
    #[serde(rename = "message:delete", rename_all = "camelCase")]
    MessageDelete { message_id: MessageId },

    /// Mark every message from the other participants as read.
    #[serde(rename = "message:read", rename_all = "camelCase")]
    MessageRead {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
    },

    /// Report which conversation the client has open, if any.
    #[serde(rename = "conversation:active", rename_all = "camelCase")]
    ConversationActive {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
    },

    /// Subscribe to a group's live events.
    #[serde(rename = "group:join", rename_all = "camelCase")]
    GroupJoin { group_id: GroupId },

    /// Unsubscribe from a group's live events.
    #[serde(rename = "group:leave", rename_all = "camelCase")]
    GroupLeave { group_id: GroupId },

    /// Ring another user with an SDP offer.
    #[serde(rename = "call:initiate", rename_all = "camelCase")]
    CallInitiate { receiver_id: UserId, offer: Value },

    /// Answer a ringing call with an SDP answer.
    #[serde(rename = "call:answer", rename_all = "camelCase")]
    CallAnswer { caller_id: UserId, answer: Value },

    /// Decline a ringing call.
    #[serde(rename = "call:reject", rename_all = "camelCase")]
    CallReject { caller_id: UserId },

    /// Relay an ICE candidate to the other party.
    #[serde(rename = "call:ice-candidate", rename_all = "camelCase")]
    CallIceCandidate { user_id: UserId, candidate: Value },

    /// Hang up the one-on-one call with a user.
    #[serde(rename = "call:end", rename_all = "camelCase")]
    CallEnd { user_id: UserId },

    /// Update mute, video, or screen-share state in a call.
    #[serde(rename = "call:media-state", rename_all = "camelCase")]
    CallMediaState {
        call_id: CallId,
        #[serde(flatten)]
        patch: MediaStatePatch,
    },

    /// Application-level keepalive.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientEvent {
    /// The wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::UserOnline => "user:online",
            ClientEvent::MessageSend { .. } => "message:send",
            ClientEvent::MessageTyping { .. } => "message:typing",
            ClientEvent::MessageReact { .. } => "message:react",
            ClientEvent::MessageDelete { .. } => "message:delete",
            ClientEvent::MessageRead { .. } => "message:read",
            ClientEvent::ConversationActive { .. } => "conversation:active",
            ClientEvent::GroupJoin { .. } => "group:join",
            ClientEvent::GroupLeave { .. } => "group:leave",
            ClientEvent::CallInitiate { .. } => "call:initiate",
            ClientEvent::CallAnswer { .. } => "call:answer",
            ClientEvent::CallReject { .. } => "call:reject",
            ClientEvent::CallIceCandidate { .. } => "call:ice-candidate",
            ClientEvent::CallEnd { .. } => "call:end",
            ClientEvent::CallMediaState { .. } => "call:media-state",
            ClientEvent::Ping { .. } => "ping",
        }
    }

    /// Validate the event payload beyond what deserialization enforces.
    ///
    /// # Errors
    ///
    /// Returns the first rule the payload violates.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            ClientEvent::UserOnline | ClientEvent::Ping { .. } => Ok(()),
            ClientEvent::MessageSend {
                receiver_id,
                group_id,
                content,
            } => {
                target_of(receiver_id, group_id)?;
                if content.trim().is_empty() {
                    return Err(ValidationError("Message content cannot be empty"));
                }
                if content.chars().count() > MAX_CONTENT_LENGTH {
                    return Err(ValidationError("Message content too long"));
                }
                Ok(())
            }
            ClientEvent::MessageTyping {
                receiver_id,
                group_id,
                ..
            }
            | ClientEvent::MessageRead {
                receiver_id,
                group_id,
            } => target_of(receiver_id, group_id).map(|_| ()),
            ClientEvent::ConversationActive {
                receiver_id,
                group_id,
            } => {
                if receiver_id.is_none() && group_id.is_none() {
                    return Ok(());
                }
                target_of(receiver_id, group_id).map(|_| ())
            }
            ClientEvent::MessageReact { reaction, .. } => {
                if reaction.trim().is_empty() {
                    return Err(ValidationError("Reaction cannot be empty"));
                }
                if reaction.len() > MAX_REACTION_LENGTH {
                    return Err(ValidationError("Reaction too long"));
                }
                Ok(())
            }
            ClientEvent::MessageDelete { .. } => Ok(()),
            ClientEvent::GroupJoin { group_id } | ClientEvent::GroupLeave { group_id } => {
                validate_id(group_id)
            }
            ClientEvent::CallInitiate { receiver_id, offer } => {
                validate_id(receiver_id)?;
                if offer.is_null() {
                    return Err(ValidationError("Offer is required"));
                }
                Ok(())
            }
            ClientEvent::CallAnswer { caller_id, answer } => {
                validate_id(caller_id)?;
                if answer.is_null() {
                    return Err(ValidationError("Answer is required"));
                }
                Ok(())
            }
            ClientEvent::CallReject { caller_id } => validate_id(caller_id),
            ClientEvent::CallIceCandidate { user_id, candidate } => {
                validate_id(user_id)?;
                if candidate.is_null() {
                    return Err(ValidationError("Candidate is required"));
                }
                Ok(())
            }
            ClientEvent::CallEnd { user_id } => validate_id(user_id),
            ClientEvent::CallMediaState { call_id, patch } => {
                validate_id(call_id)?;
                if patch.is_empty() {
                    return Err(ValidationError("Media state update is empty"));
                }
                Ok(())
            }
        }
    }

    /// The conversation a messaging event addresses, if it addresses one.
    ///
    /// Returns `None` for events without a conversation target and for
    /// `conversation:active` with no target (the client closed the view).
    #[must_use]
    pub fn conversation_target(&self) -> Option<ConversationTarget> {
        match self {
            ClientEvent::MessageSend {
                receiver_id,
                group_id,
                ..
            }
            | ClientEvent::MessageTyping {
                receiver_id,
                group_id,
                ..
            }
            | ClientEvent::MessageRead {
                receiver_id,
                group_id,
            }
            | ClientEvent::ConversationActive {
                receiver_id,
                group_id,
            } => target_of(receiver_id, group_id).ok(),
            _ => None,
        }
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Connection accepted.
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        connection_id: String,
        user_id: UserId,
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    #[serde(rename = "presence:online", rename_all = "camelCase")]
    PresenceOnline { user_id: UserId },

    #[serde(rename = "presence:offline", rename_all = "camelCase")]
    PresenceOffline { user_id: UserId, last_seen: u64 },

    /// Friends that are online right now, sent after registration.
    #[serde(rename = "presence:snapshot", rename_all = "camelCase")]
    PresenceSnapshot { online: Vec<UserId> },

    #[serde(rename = "message:new", rename_all = "camelCase")]
    MessageNew {
        message: ChatMessage,
        /// Recipient's unread count for the conversation, this message included.
        unread_count: u64,
    },

    /// Confirmation to the sender that the message was accepted.
    #[serde(rename = "message:sent", rename_all = "camelCase")]
    MessageSent { message: ChatMessage },

    #[serde(rename = "message:delivered", rename_all = "camelCase")]
    MessageDelivered {
        message_id: MessageId,
        conversation_key: String,
        recipient_id: UserId,
    },

    #[serde(rename = "message:reaction-added", rename_all = "camelCase")]
    MessageReactionAdded {
        message_id: MessageId,
        conversation_key: String,
        user_id: UserId,
        reaction: String,
        added_at: u64,
    },

    #[serde(rename = "message:reaction-removed", rename_all = "camelCase")]
    MessageReactionRemoved {
        message_id: MessageId,
        conversation_key: String,
        user_id: UserId,
        reaction: String,
    },

    #[serde(rename = "message:deleted", rename_all = "camelCase")]
    MessageDeleted {
        message_id: MessageId,
        conversation_key: String,
        deleted_by: UserId,
    },

    #[serde(rename = "messages:read", rename_all = "camelCase")]
    MessagesRead {
        conversation_key: String,
        reader_id: UserId,
        message_ids: Vec<MessageId>,
        read_at: u64,
    },

    #[serde(rename = "user:typing", rename_all = "camelCase")]
    UserTyping {
        conversation_key: String,
        user_id: UserId,
        is_typing: bool,
        /// Validity window of the indicator, see [`TYPING_INDICATOR_TTL_MS`].
        ttl_ms: u64,
    },

    #[serde(rename = "group:joined", rename_all = "camelCase")]
    GroupJoined { group_id: GroupId },

    #[serde(rename = "group:left", rename_all = "camelCase")]
    GroupLeft { group_id: GroupId },

    #[serde(rename = "call:incoming", rename_all = "camelCase")]
    CallIncoming {
        call_id: CallId,
        caller_id: UserId,
        offer: Value,
    },

    /// Acknowledges `call:initiate` to the caller while the callee rings.
    #[serde(rename = "call:ringing", rename_all = "camelCase")]
    CallRinging { call_id: CallId, callee_id: UserId },

    #[serde(rename = "call:answered", rename_all = "camelCase")]
    CallAnswered {
        call_id: CallId,
        callee_id: UserId,
        answer: Value,
    },

    #[serde(rename = "call:ice-candidate", rename_all = "camelCase")]
    CallIceCandidate {
        call_id: CallId,
        user_id: UserId,
        candidate: Value,
    },

    #[serde(rename = "call:ended", rename_all = "camelCase")]
    CallEnded {
        call_id: CallId,
        /// The user whose action (or absence) ended the call.
        user_id: UserId,
        reason: CallEndReason,
    },

    #[serde(rename = "call:participant-joined", rename_all = "camelCase")]
    CallParticipantJoined {
        call_id: CallId,
        participant: ParticipantInfo,
    },

    #[serde(rename = "call:participant-left", rename_all = "camelCase")]
    CallParticipantLeft { call_id: CallId, user_id: UserId },

    #[serde(rename = "call:participant-updated", rename_all = "camelCase")]
    CallParticipantUpdated {
        call_id: CallId,
        participant: ParticipantInfo,
    },

    #[serde(rename = "friend:request", rename_all = "camelCase")]
    FriendRequest { from_user_id: UserId, payload: Value },

    #[serde(rename = "friend:accepted", rename_all = "camelCase")]
    FriendAccepted { by_user_id: UserId, payload: Value },

    #[serde(rename = "notification:new", rename_all = "camelCase")]
    NotificationNew { payload: Value },

    /// Rejection of an inbound event, sent to its originator only.
    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        code: ErrorCode,
        message: String,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerEvent {
    /// The wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::PresenceOnline { .. } => "presence:online",
            ServerEvent::PresenceOffline { .. } => "presence:offline",
            ServerEvent::PresenceSnapshot { .. } => "presence:snapshot",
            ServerEvent::MessageNew { .. } => "message:new",
            ServerEvent::MessageSent { .. } => "message:sent",
            ServerEvent::MessageDelivered { .. } => "message:delivered",
            ServerEvent::MessageReactionAdded { .. } => "message:reaction-added",
            ServerEvent::MessageReactionRemoved { .. } => "message:reaction-removed",
            ServerEvent::MessageDeleted { .. } => "message:deleted",
            ServerEvent::MessagesRead { .. } => "messages:read",
            ServerEvent::UserTyping { .. } => "user:typing",
            ServerEvent::GroupJoined { .. } => "group:joined",
            ServerEvent::GroupLeft { .. } => "group:left",
            ServerEvent::CallIncoming { .. } => "call:incoming",
            ServerEvent::CallRinging { .. } => "call:ringing",
            ServerEvent::CallAnswered { .. } => "call:answered",
            ServerEvent::CallIceCandidate { .. } => "call:ice-candidate",
            ServerEvent::CallEnded { .. } => "call:ended",
            ServerEvent::CallParticipantJoined { .. } => "call:participant-joined",
            ServerEvent::CallParticipantLeft { .. } => "call:participant-left",
            ServerEvent::CallParticipantUpdated { .. } => "call:participant-updated",
            ServerEvent::FriendRequest { .. } => "friend:request",
            ServerEvent::FriendAccepted { .. } => "friend:accepted",
            ServerEvent::NotificationNew { .. } => "notification:new",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Pong { .. } => "pong",
        }
    }

    /// Create an error event.
    #[must_use]
    pub fn error(event: Option<&str>, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            event: event.map(str::to_string),
            code,
            message: message.into(),
        }
    }
}
