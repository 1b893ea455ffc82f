//! Domain types: users, conversations and messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tether_protocol::{AttachmentRef, MessagePayload};

/// Opaque identifier of a user, owned by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a persisted conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a single message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two participants of a conversation, stored in sorted order.
///
/// `ParticipantPair::new(a, b) == ParticipantPair::new(b, a)`, so the pair
/// can key lookups regardless of who sent first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantPair([UserId; 2]);

impl ParticipantPair {
    #[must_use]
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self([a, b])
        } else {
            Self([b, a])
        }
    }

    #[must_use]
    pub fn contains(&self, user: &UserId) -> bool {
        self.0.contains(user)
    }

    /// The participant that is not `user`.
    #[must_use]
    pub fn other(&self, user: &UserId) -> Option<&UserId> {
        match &self.0 {
            [a, b] if a == user => Some(b),
            [a, b] if b == user => Some(a),
            _ => None,
        }
    }

    #[must_use]
    pub fn users(&self) -> &[UserId; 2] {
        &self.0
    }
}

/// A stored file attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Where the upload was written.
    pub path: String,
    /// Original client filename.
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub size: u64,
}

impl Attachment {
    #[must_use]
    pub fn to_ref(&self) -> AttachmentRef {
        AttachmentRef {
            path: self.path.clone(),
            filename: self.filename.clone(),
            content_type: self.content_type.clone(),
            size: self.size,
        }
    }
}

/// A persisted chat message. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: UserId,
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Short human-readable summary used in notifications.
    #[must_use]
    pub fn summary(&self) -> String {
        match (&self.text, &self.attachment) {
            (Some(text), _) => text.clone(),
            (None, Some(attachment)) => format!("Sent you an attachment: {}", attachment.filename),
            (None, None) => String::new(),
        }
    }
}

/// A message that has not been appended yet.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: UserId,
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
}

/// The persisted thread between two users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: ParticipantPair,
    pub messages: Vec<Message>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Create an empty conversation for a pair.
    #[must_use]
    pub fn new(participants: ParticipantPair) -> Self {
        Self {
            id: ConversationId::generate(),
            participants,
            messages: Vec::new(),
            last_notified_at: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Profile data owned by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    /// Contact address for offline notifications.
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub last_active: Option<DateTime<Utc>>,
}

impl UserProfile {
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// The email address, if one is set and non-blank.
    #[must_use]
    pub fn contact_address(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|address| !address.is_empty())
    }
}

/// Sender fields populated from the user's profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderSummary {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
}

impl SenderSummary {
    /// Build from a profile, or a placeholder when the profile is missing.
    #[must_use]
    pub fn from_profile(id: &UserId, profile: Option<&UserProfile>) -> Self {
        match profile {
            Some(profile) => Self {
                id: id.clone(),
                first_name: profile.first_name.clone(),
                last_name: profile.last_name.clone(),
            },
            None => Self {
                id: id.clone(),
                first_name: "Unknown".to_string(),
                last_name: String::new(),
            },
        }
    }
}

/// A message with its sender populated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    #[serde(rename = "_id")]
    pub id: MessageId,
    #[serde(rename = "senderId")]
    pub sender: SenderSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
}

/// The conversation document returned to REST callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    #[serde(rename = "_id")]
    pub id: ConversationId,
    pub participants: ParticipantPair,
    pub messages: Vec<MessageView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_notified_at: Option<DateTime<Utc>>,
}

/// Project a stored message into the live delivery payload.
#[must_use]
pub fn message_payload(
    conversation: &ConversationId,
    message: &Message,
    sender: &SenderSummary,
) -> MessagePayload {
    MessagePayload {
        conversation_id: conversation.to_string(),
        message_id: message.id.to_string(),
        sender_id: message.sender.to_string(),
        first_name: sender.first_name.clone(),
        last_name: sender.last_name.clone(),
        text: message.text.clone(),
        attachment: message.attachment.as_ref().map(Attachment::to_ref),
        created_at: message.created_at,
    }
}
