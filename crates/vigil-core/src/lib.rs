//! # vigil-core
//!
//! The realtime communication core of Vigil: who is online, where their
//! events go, and how messages and calls flow between them.
//!
//! - **Registry** - one live connection per identity, the source of truth for presence
//! - **Router** - validates, authorizes, and dispatches client events
//! - **Delivery** - ordered direct and group messaging with receipts and reactions
//! - **Call** - call sessions and the one-on-one offer/answer handshake
//! - **Notify** - fan-out of asynchronous notifications to online users
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │  Transport  │────▶│   Router    │────▶│   Delivery   │
//! └─────────────┘     └─────────────┘     │     Call     │
//!        ▲                   │            │    Notify    │
//!        │                   ▼            └──────────────┘
//!        │            ┌─────────────┐            │
//!        └────────────│  Registry   │◀───────────┘
//!                     └─────────────┘
//! ```
//!
//! Durable state lives behind the [`Store`] trait; [`InMemoryStore`] is
//! provided for tests and single-node development.

pub mod call;
pub mod conversation;
pub mod delivery;
pub mod error;
pub mod ids;
pub mod notify;
pub mod presence;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod store;

pub use call::{CallConfig, CallService, CreateCall, CreatedCall, JoinedCall};
pub use conversation::{Conversation, ConversationKey, ConversationKind};
pub use delivery::{ConversationService, ReactionChange, DEFAULT_RETAINED_MESSAGES};
pub use error::{RealtimeError, StoreError};
pub use notify::{Notification, NotificationFanout};
pub use presence::PresenceService;
pub use registry::{
    CloseReason, ConnectionHandle, ConnectionId, ConnectionRegistry, Outbound, Registration,
};
pub use rooms::{RoomDirectory, RoomError, RoomStats};
pub use router::{EventRouter, RouterConfig};
pub use store::{InMemoryStore, RtcGrant, RtcTokenIssuer, Store, UnsignedTokenIssuer};
