//! # vigil-protocol
//!
//! Wire protocol definitions for the Vigil realtime core.
//!
//! Clients and the server exchange named events over a persistent
//! WebSocket. This crate defines those events, the data types they carry,
//! and the codecs for both frame flavours.
//!
//! ## Event families
//!
//! - `user:*` / `presence:*` - Who is online
//! - `message:*` / `messages:read` - Direct and group messaging
//! - `group:*` - Live subscription to group conversations
//! - `call:*` - Call signaling and participant media state
//! - `friend:*` / `notification:new` - Notification fan-out
//! - `error` - Rejection of an inbound event
//!
//! ## Example
//!
//! ```rust
//! use vigil_protocol::{codec, ClientEvent};
//!
//! let event: ClientEvent = codec::decode_text(
//!     r#"{"event":"message:send","data":{"receiverId":"bob","content":"Hello"}}"#,
//! ).unwrap();
//! assert_eq!(event.name(), "message:send");
//!
//! let binary = codec::encode(&event).unwrap();
//! let decoded: ClientEvent = codec::decode(&binary).unwrap();
//! assert_eq!(decoded, event);
//! ```

pub mod codec;
pub mod events;
pub mod types;

pub use codec::{decode, decode_text, encode, encode_text, ProtocolError};
pub use events::{
    ClientEvent, ConversationTarget, ErrorCode, ServerEvent, ValidationError,
    TYPING_INDICATOR_TTL_MS,
};
pub use types::*;

/// Current protocol version, announced in the `connected` event.
pub const PROTOCOL_VERSION: u8 = 1;
