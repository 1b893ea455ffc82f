//! # tether-core
//!
//! Presence-aware realtime delivery for two-person chats.
//!
//! This crate provides the building blocks the server wires together:
//!
//! - **Room** - Deterministic room identity for a pair of users
//! - **Presence** - Which users currently hold an open connection
//! - **Router** - Room-scoped (and degraded global) event delivery
//! - **Session** - Per-connection `join` / `typing` / `disconnect` lifecycle
//! - **Notify** - Offline-notification policy with a per-conversation cooldown
//! - **Pipeline** - Validate, persist, broadcast and notify for a new message
//! - **Store** - The persistence seam, with an in-memory implementation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│   Router    │◀────│  Pipeline   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   ▲                   │
//!        ▼                   │                   ▼
//! ┌─────────────┐            │            ┌─────────────┐
//! │  Presence   │────────────┴───────────▶│  Notifier   │
//! └─────────────┘                         └─────────────┘
//! ```

pub mod envelope;
pub mod hub;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod presence;
pub mod room;
pub mod router;
pub mod session;
pub mod store;

pub use envelope::Envelope;
pub use hub::Hub;
pub use model::{
    Attachment, Conversation, ConversationId, ConversationView, Message, MessageId,
    ParticipantPair, UserId, UserProfile,
};
pub use notify::{
    Decision, LogNotifier, NotificationBody, NotificationDecider, Notifier, NotifyError,
    SkipReason,
};
pub use pipeline::{
    Delivery, DeliveryMode, MessagePipeline, NotificationHandle, NotificationOutcome,
    PipelineConfig, PipelineError, SendRequest,
};
pub use presence::PresenceRegistry;
pub use room::RoomId;
pub use router::{BroadcastRouter, ConnectionId, Inbox, RouterConfig, RouterError, RouterStats};
pub use session::{ConnectionSession, SessionError, SessionState};
pub use store::{ChatStore, MemoryStore, StoreError};
