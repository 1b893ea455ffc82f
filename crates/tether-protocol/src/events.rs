//! Event types for the Tether protocol.
//!
//! Events are adjacently tagged: `{"event": "<name>", "data": {...}}`. The
//! names match the ones browser clients already listen for, so they are kept
//! in camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current protocol version, announced in the `connected` event.
pub const PROTOCOL_VERSION: u8 = 1;

/// Error codes carried by [`ServerEvent::Error`].
pub mod error_codes {
    /// The frame could not be decoded.
    pub const MALFORMED: u16 = 1001;
    /// The frame exceeded the configured size limit.
    pub const TOO_LARGE: u16 = 1002;
    /// The event is not valid in the session's current state.
    pub const INVALID_STATE: u16 = 1003;
    /// The event carried invalid fields.
    pub const INVALID_EVENT: u16 = 1004;
    /// Something failed on the server.
    pub const INTERNAL: u16 = 1500;
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Announce the conversation partner and enter the shared room.
    #[serde(rename = "joinChat", rename_all = "camelCase")]
    JoinChat {
        /// Display name of the joining user.
        #[serde(default)]
        first_name: String,
        /// The joining user.
        user_id: String,
        /// The conversation partner.
        target_user_id: String,
    },

    /// Typing indicator for the room shared with `target_user_id`.
    #[serde(rename = "typing", rename_all = "camelCase")]
    Typing {
        user_id: String,
        target_user_id: String,
        is_typing: bool,
    },

    /// Application-level keepalive.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientEvent {
    /// Event name as it appears on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinChat { .. } => "joinChat",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::Ping { .. } => "ping",
        }
    }
}

/// Reference to a stored attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub path: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub size: u64,
}

/// A chat message as delivered to live clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub conversation_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
    pub created_at: DateTime<Utc>,
}

impl MessagePayload {
    /// Full display name of the sender.
    #[must_use]
    pub fn sender_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Sent once when the socket is accepted.
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected { connection_id: String, version: u8 },

    /// Full list of online users.
    #[serde(rename = "onlineUsers")]
    OnlineUsers(Vec<String>),

    /// The peer started or stopped typing.
    #[serde(rename = "userTyping", rename_all = "camelCase")]
    UserTyping { user_id: String, is_typing: bool },

    /// A new message in the room.
    #[serde(rename = "messageReceived")]
    MessageReceived(MessagePayload),

    /// Unread-badge hint targeted at the recipient's connections.
    #[serde(rename = "messageNotification", rename_all = "camelCase")]
    MessageNotification {
        sender_id: String,
        sender_name: String,
        message: String,
    },

    /// Reply to a client ping.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// A client event failed. The connection stays open.
    #[serde(rename = "error")]
    Error { code: u16, message: String },
}

impl ServerEvent {
    /// Create an error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Event name as it appears on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::OnlineUsers(_) => "onlineUsers",
            ServerEvent::UserTyping { .. } => "userTyping",
            ServerEvent::MessageReceived(_) => "messageReceived",
            ServerEvent::MessageNotification { .. } => "messageNotification",
            ServerEvent::Pong { .. } => "pong",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Whether this event carries private message content.
    #[must_use]
    pub fn is_private(&self) -> bool {
        matches!(
            self,
            ServerEvent::MessageReceived(_) | ServerEvent::MessageNotification { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_chat_wire_shape() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "joinChat",
            "data": {"firstName": "Ada", "userId": "u1", "targetUserId": "u2"}
        }))
        .unwrap();

        assert_eq!(
            event,
            ClientEvent::JoinChat {
                first_name: "Ada".into(),
                user_id: "u1".into(),
                target_user_id: "u2".into(),
            }
        );
        assert_eq!(event.name(), "joinChat");
    }

    #[test]
    fn test_online_users_is_a_plain_array() {
        let event = ServerEvent::OnlineUsers(vec!["a".into(), "b".into()]);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"event": "onlineUsers", "data": ["a", "b"]}));
    }

    #[test]
    fn test_message_payload_skips_empty_fields() {
        let payload = MessagePayload {
            conversation_id: "c1".into(),
            message_id: "m1".into(),
            sender_id: "u1".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            text: Some("hi".into()),
            attachment: None,
            created_at: Utc::now(),
        };
        assert_eq!(payload.sender_name(), "Ada Lovelace");

        let value = serde_json::to_value(ServerEvent::MessageReceived(payload)).unwrap();
        assert_eq!(value["event"], "messageReceived");
        assert_eq!(value["data"]["text"], "hi");
        assert_eq!(value["data"]["firstName"], "Ada");
        assert!(value["data"].get("attachment").is_none());
    }

    #[test]
    fn test_privacy_classification() {
        assert!(!ServerEvent::OnlineUsers(vec![]).is_private());
        assert!(ServerEvent::MessageNotification {
            sender_id: "a".into(),
            sender_name: "A".into(),
            message: "secret".into(),
        }
        .is_private());
    }
}
