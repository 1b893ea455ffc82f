//! Persistence seam for conversations and user profiles.
//!
//! The core never talks to a database directly. It goes through
//! [`ChatStore`], which the server backs with [`MemoryStore`] and tests can
//! replace with failing or recording doubles.

use crate::model::{
    Conversation, ConversationId, Message, MessageId, NewMessage, ParticipantPair, UserId,
    UserProfile,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No conversation with this id.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// The sender is not one of the conversation's participants.
    #[error("User {user} is not a participant of conversation {conversation}")]
    NotParticipant {
        user: UserId,
        conversation: ConversationId,
    },

    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Conversation and profile persistence.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Find the conversation between two users, in either order.
    async fn find_conversation(
        &self,
        pair: &ParticipantPair,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Create the conversation for a pair.
    ///
    /// If a concurrent caller created it first, that conversation is
    /// returned instead, so a pair never ends up with two threads.
    async fn create_conversation(&self, pair: &ParticipantPair)
        -> Result<Conversation, StoreError>;

    /// Load a conversation by id.
    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Append a message, assigning its id and server timestamp.
    ///
    /// Appends to one conversation are serialized; timestamps never go
    /// backwards within a conversation.
    async fn append_message(
        &self,
        id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, StoreError>;

    /// Record when the last offline notification for a conversation was sent.
    async fn set_last_notified(
        &self,
        id: &ConversationId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Load a user's profile.
    async fn find_user(&self, id: &UserId) -> Result<Option<UserProfile>, StoreError>;

    /// Update a user's last-active timestamp.
    async fn update_last_active(&self, id: &UserId, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Find the conversation for a pair, creating it if absent.
///
/// # Errors
///
/// Returns an error if the store fails.
pub async fn find_or_create_conversation(
    store: &dyn ChatStore,
    pair: &ParticipantPair,
) -> Result<Conversation, StoreError> {
    match store.find_conversation(pair).await? {
        Some(conversation) => Ok(conversation),
        None => store.create_conversation(pair).await,
    }
}

/// In-memory [`ChatStore`].
///
/// Conversations are keyed by id with a secondary index on the participant
/// pair. Each `DashMap` shard lock doubles as the per-conversation append
/// lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    conversations: DashMap<ConversationId, Conversation>,
    by_pair: DashMap<ParticipantPair, ConversationId>,
    users: DashMap<UserId, UserProfile>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user profile.
    pub fn upsert_user(&self, profile: UserProfile) {
        debug!(user = %profile.id, "Upserting user profile");
        self.users.insert(profile.id.clone(), profile);
    }

    /// Number of stored conversations.
    #[must_use]
    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn find_conversation(
        &self,
        pair: &ParticipantPair,
    ) -> Result<Option<Conversation>, StoreError> {
        let id = match self.by_pair.get(pair) {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        Ok(self.conversations.get(&id).map(|c| c.clone()))
    }

    async fn create_conversation(
        &self,
        pair: &ParticipantPair,
    ) -> Result<Conversation, StoreError> {
        let id = self
            .by_pair
            .entry(pair.clone())
            .or_insert_with(|| {
                let conversation = Conversation::new(pair.clone());
                let id = conversation.id.clone();
                debug!(conversation = %id, "Created conversation");
                self.conversations.insert(id.clone(), conversation);
                id
            })
            .clone();

        self.conversations
            .get(&id)
            .map(|c| c.clone())
            .ok_or(StoreError::ConversationNotFound(id))
    }

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.get(id).map(|c| c.clone()))
    }

    async fn append_message(
        &self,
        id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, StoreError> {
        let mut conversation = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::ConversationNotFound(id.clone()))?;

        if !conversation.participants.contains(&message.sender) {
            return Err(StoreError::NotParticipant {
                user: message.sender,
                conversation: id.clone(),
            });
        }

        let now = Utc::now();
        let created_at = match conversation.last_message() {
            Some(last) if last.created_at > now => last.created_at,
            _ => now,
        };

        let message = Message {
            id: MessageId::generate(),
            sender: message.sender,
            text: message.text,
            attachment: message.attachment,
            created_at,
        };
        conversation.messages.push(message.clone());

        Ok(message)
    }

    async fn set_last_notified(
        &self,
        id: &ConversationId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conversation = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::ConversationNotFound(id.clone()))?;
        conversation.last_notified_at = Some(at);
        Ok(())
    }

    async fn find_user(&self, id: &UserId) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.users.get(id).map(|u| u.clone()))
    }

    async fn update_last_active(&self, id: &UserId, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(mut user) = self.users.get_mut(id) {
            user.last_active = Some(at);
        }
        Ok(())
    }
}
