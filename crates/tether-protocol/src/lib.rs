//! # tether-protocol
//!
//! Wire events for the Tether realtime chat engine.
//!
//! Clients talk to the server over a WebSocket. Every frame carries exactly
//! one event, named the same way regardless of encoding:
//!
//! - `joinChat` / `typing` - sent by clients
//! - `connected` / `onlineUsers` / `userTyping` - presence and session events
//! - `messageReceived` / `messageNotification` - chat delivery
//! - `error` - per-event failures (the connection stays open)
//!
//! Text frames carry JSON, binary frames carry length-prefixed MessagePack.
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{codec, ClientEvent};
//!
//! let json = r#"{"event":"typing","data":{"userId":"a","targetUserId":"b","isTyping":true}}"#;
//! let event: ClientEvent = codec::decode_text(json).unwrap();
//! assert!(matches!(event, ClientEvent::Typing { is_typing: true, .. }));
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode_text, encode_text, ProtocolError, WireFormat};
pub use events::{
    error_codes, AttachmentRef, ClientEvent, MessagePayload, ServerEvent, PROTOCOL_VERSION,
};
