//! Error types for the realtime core.

use thiserror::Error;
use vigil_protocol::{CallId, ErrorCode, MessageId, UserId};

/// Failure reported by an external collaborator (persistence, directory,
/// RTC token minting).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The collaborator could not be reached or refused the write.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The referenced record does not exist.
    #[error("Record not found: {0}")]
    NotFound(String),
}

/// Errors produced while handling realtime events.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// No identity is bound to the connection.
    #[error("Connection is not authenticated")]
    Unauthenticated,

    /// The transport handle cannot be registered.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The identity may not act on the target.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Malformed or semantically invalid payload.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// The call reached its participant limit.
    #[error("Call is full")]
    CallFull,

    /// The call has already ended.
    #[error("Call has ended")]
    CallEnded,

    /// No such call.
    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    /// The user is already in or ringing for another one-on-one call.
    #[error("User is busy: {0}")]
    CallBusy(UserId),

    /// No such message.
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// No such conversation.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// The target has no live connection.
    #[error("Target unreachable: {0}")]
    TargetUnreachable(UserId),

    /// An external collaborator failed; nothing was applied.
    #[error("Persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

impl RealtimeError {
    /// The wire error code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            RealtimeError::Unauthenticated => ErrorCode::Unauthenticated,
            RealtimeError::Unauthorized(_) => ErrorCode::Unauthorized,
            RealtimeError::Forbidden(_) => ErrorCode::Forbidden,
            RealtimeError::InvalidEvent(_) => ErrorCode::InvalidEvent,
            RealtimeError::CallFull => ErrorCode::CallFull,
            RealtimeError::CallEnded => ErrorCode::CallEnded,
            RealtimeError::CallNotFound(_) => ErrorCode::CallNotFound,
            RealtimeError::CallBusy(_) => ErrorCode::CallBusy,
            RealtimeError::MessageNotFound(_) => ErrorCode::MessageNotFound,
            RealtimeError::ConversationNotFound(_) => ErrorCode::ConversationNotFound,
            RealtimeError::TargetUnreachable(_) => ErrorCode::TargetUnreachable,
            RealtimeError::Persistence(_) => ErrorCode::PersistenceFailed,
        }
    }

    /// Short label used for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RealtimeError::Unauthenticated => "unauthenticated",
            RealtimeError::Unauthorized(_) => "unauthorized",
            RealtimeError::Forbidden(_) => "forbidden",
            RealtimeError::InvalidEvent(_) => "invalid_event",
            RealtimeError::CallFull => "call_full",
            RealtimeError::CallEnded => "call_ended",
            RealtimeError::CallNotFound(_) => "call_not_found",
            RealtimeError::CallBusy(_) => "call_busy",
            RealtimeError::MessageNotFound(_) => "message_not_found",
            RealtimeError::ConversationNotFound(_) => "conversation_not_found",
            RealtimeError::TargetUnreachable(_) => "target_unreachable",
            RealtimeError::Persistence(_) => "persistence",
        }
    }
}
