//! Data types shared by inbound and outbound events.
//!
//! Field names are camelCase on the wire to match the platform's clients.

use serde::{Deserialize, Serialize};

/// A user identifier, as issued by the authentication provider.
pub type UserId = String;

/// A group identifier.
pub type GroupId = String;

/// A message identifier. Strictly increasing within a server process.
pub type MessageId = u64;

/// A call identifier.
pub type CallId = String;

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Accepted by the server and persisted.
    Sent,
    /// Shown to a recipient who had the conversation open.
    Delivered,
    /// Explicitly marked as read by a recipient.
    Read,
}

/// A single reaction on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user_id: UserId,
    pub reaction: String,
    pub added_at: u64,
}

/// A chat message as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    /// 1-based position within the conversation.
    pub seq: u64,
    pub conversation_key: String,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: u64,
    pub status: MessageStatus,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

/// One-on-one or group call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    OneOnOne,
    Group,
}

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Scheduled,
    Active,
    Ended,
}

/// Why a call ended, as reported in `call:ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallEndReason {
    /// The last participant left.
    Completed,
    /// The other party of a one-on-one call hung up.
    HungUp,
    /// The host ended the call for everyone.
    HostEnded,
    /// The callee declined the call.
    Rejected,
    /// The callee was online but never answered.
    NoAnswer,
    /// The callee had no live connection.
    Unreachable,
    /// The other party's connection dropped.
    PeerDisconnected,
    /// The caller withdrew the call before it was answered.
    Cancelled,
}

/// Live media state of one call participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub user_id: UserId,
    /// Numeric uid on the RTC network.
    pub uid: u32,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub is_screen_sharing: bool,
    pub joined_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_at: Option<u64>,
}

impl ParticipantInfo {
    /// Whether the participant is currently in the call.
    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.left_at.is_none()
    }
}

/// Partial update of a participant's media state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_video_off: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_screen_sharing: Option<bool>,
}

impl MediaStatePatch {
    /// Whether the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.is_muted.is_none() && self.is_video_off.is_none() && self.is_screen_sharing.is_none()
    }

    /// Apply the patch to a participant.
    pub fn apply(&self, participant: &mut ParticipantInfo) {
        if let Some(muted) = self.is_muted {
            participant.is_muted = muted;
        }
        if let Some(video_off) = self.is_video_off {
            participant.is_video_off = video_off;
        }
        if let Some(sharing) = self.is_screen_sharing {
            participant.is_screen_sharing = sharing;
        }
    }
}

/// Snapshot of a call's session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSummary {
    pub id: CallId,
    pub host_id: UserId,
    #[serde(rename = "type")]
    pub call_type: CallType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<u64>,
    pub channel_name: String,
    pub max_participants: usize,
    pub participants: Vec<ParticipantInfo>,
}

/// Credentials a client uses to connect to the external RTC network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallCredentials {
    pub app_id: String,
    pub channel_name: String,
    pub token: String,
    pub uid: u32,
}
