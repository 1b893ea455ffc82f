//! Message ingestion.
//!
//! A send runs validate, locate-or-create, append, populate, route and
//! notify in that order. Only the first three can fail the request. Once the
//! message is stored, later steps log and degrade instead of failing: the
//! sender still gets success, and a peer who missed the live event can load
//! the history.

use crate::hub::Hub;
use crate::model::{
    message_payload, Attachment, Conversation, ConversationId, ConversationView, Message,
    MessageView, NewMessage, ParticipantPair, SenderSummary, UserId, UserProfile,
};
use crate::notify::{Decision, NotificationBody, NotificationDecider, Notifier, NotifyError, SkipReason};
use crate::room::RoomId;
use crate::store::{find_or_create_conversation, ChatStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::{MessagePayload, ServerEvent};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pipeline errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The request is malformed. Nothing was stored.
    #[error("{0}")]
    Validation(String),

    /// The store failed before the message was persisted.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// How message payloads reach live clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Only the two participants' room.
    #[default]
    Room,
    /// Every connected client. Leaks message content to everyone; exists for
    /// old clients that never join rooms.
    GlobalDegraded,
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub delivery_mode: DeliveryMode,
    /// Maximum message length in characters.
    pub max_text_length: usize,
    pub notification_subject: String,
    /// Upper bound on a single notification send.
    pub notification_timeout: Duration,
    pub cooldown_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Room,
            max_text_length: 4000,
            notification_subject: "New Message on Tether".to_string(),
            notification_timeout: Duration::from_secs(10),
            cooldown_secs: crate::notify::DEFAULT_COOLDOWN_SECS,
        }
    }
}

/// A request to send one message.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub sender: UserId,
    pub target: UserId,
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
}

impl SendRequest {
    /// A text-only message.
    #[must_use]
    pub fn text(sender: impl Into<UserId>, target: impl Into<UserId>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            target: target.into(),
            text: Some(text.into()),
            attachment: None,
        }
    }
}

/// What happened to the offline notification for a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    Sent,
    Skipped(SkipReason),
    Failed(String),
}

impl NotificationOutcome {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationOutcome::Sent => "sent",
            NotificationOutcome::Skipped(reason) => reason.as_str(),
            NotificationOutcome::Failed(_) => "failed",
        }
    }
}

/// Handle to the notification step of a send.
///
/// Dropping it detaches the background task.
#[derive(Debug)]
pub enum NotificationHandle {
    /// Decided without I/O.
    Ready(NotificationOutcome),
    /// Still running in the background.
    Pending(JoinHandle<NotificationOutcome>),
}

impl NotificationHandle {
    /// Wait for the notification step to finish.
    pub async fn outcome(self) -> NotificationOutcome {
        match self {
            NotificationHandle::Ready(outcome) => outcome,
            NotificationHandle::Pending(handle) => handle
                .await
                .unwrap_or_else(|e| NotificationOutcome::Failed(e.to_string())),
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, NotificationHandle::Pending(_))
    }
}

/// Result of a successful send.
#[derive(Debug)]
pub struct Delivery {
    /// The conversation after the append, with senders populated.
    pub conversation: ConversationView,
    /// The stored message.
    pub message: Message,
    /// Connections the live event was queued for.
    pub recipients: usize,
    pub notification: NotificationHandle,
}

/// Orchestrates message sends and history fetches.
#[derive(Clone)]
pub struct MessagePipeline {
    hub: Arc<Hub>,
    store: Arc<dyn ChatStore>,
    notifier: Arc<dyn Notifier>,
    decider: NotificationDecider,
    config: Arc<PipelineConfig>,
}

impl MessagePipeline {
    #[must_use]
    pub fn new(
        hub: Arc<Hub>,
        store: Arc<dyn ChatStore>,
        notifier: Arc<dyn Notifier>,
        config: PipelineConfig,
    ) -> Self {
        info!(
            delivery = ?config.delivery_mode,
            notifier = notifier.name(),
            cooldown_secs = config.cooldown_secs,
            "Creating message pipeline"
        );
        if config.delivery_mode == DeliveryMode::GlobalDegraded {
            warn!("Global delivery mode: message content is sent to every connected client");
        }

        Self {
            hub,
            store,
            notifier,
            decider: NotificationDecider::from_secs(config.cooldown_secs),
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    /// Send a message from `request.sender` to `request.target`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty or oversized message, or a
    /// store error if the message could not be persisted. In both cases
    /// nothing is broadcast.
    pub async fn send(&self, request: SendRequest) -> Result<Delivery, PipelineError> {
        let SendRequest {
            sender,
            target,
            text,
            attachment,
        } = request;
        let text = text.filter(|t| !t.trim().is_empty());
        self.validate(&sender, &target, text.as_deref(), attachment.is_some())?;

        let pair = ParticipantPair::new(sender.clone(), target.clone());
        let conversation = find_or_create_conversation(self.store.as_ref(), &pair).await?;
        let message = self
            .store
            .append_message(
                &conversation.id,
                NewMessage {
                    sender: sender.clone(),
                    text,
                    attachment,
                },
            )
            .await?;

        debug!(
            conversation = %conversation.id,
            message = %message.id,
            sender = %sender,
            target = %target,
            "Message stored"
        );

        let profiles = self.load_profiles(&pair).await;
        let sender_summary = SenderSummary::from_profile(&sender, profiles.get(&sender));
        let payload = message_payload(&conversation.id, &message, &sender_summary);
        let sender_name = payload.sender_name();
        let recipients = self.route(&sender, &target, payload, message.summary());

        let reloaded = self.store.get_conversation(&conversation.id).await;
        let conversation = match reloaded {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                warn!(conversation = %conversation.id, "Conversation vanished after append");
                with_message(conversation, &message)
            }
            Err(e) => {
                warn!(conversation = %conversation.id, error = %e, "Failed to reload conversation");
                with_message(conversation, &message)
            }
        };

        let body = NotificationBody {
            sender_name,
            message: message.summary(),
        };
        let notification = self.schedule_notification(&conversation, &target, body);

        Ok(Delivery {
            conversation: populate(&conversation, &profiles),
            message,
            recipients,
            notification,
        })
    }

    /// Load the conversation between `user` and `target`, creating an empty
    /// one if they have never talked.
    ///
    /// # Errors
    ///
    /// Returns an error if `target` is empty or the store fails.
    pub async fn fetch(
        &self,
        user: &UserId,
        target: &UserId,
    ) -> Result<ConversationView, PipelineError> {
        if target.is_empty() {
            return Err(PipelineError::Validation("Target user is required".into()));
        }

        let pair = ParticipantPair::new(user.clone(), target.clone());
        let conversation = find_or_create_conversation(self.store.as_ref(), &pair).await?;
        let profiles = self.load_profiles(&pair).await;
        Ok(populate(&conversation, &profiles))
    }

    fn validate(
        &self,
        sender: &UserId,
        target: &UserId,
        text: Option<&str>,
        has_attachment: bool,
    ) -> Result<(), PipelineError> {
        if sender.is_empty() {
            return Err(PipelineError::Validation("Sender is required".into()));
        }
        if target.is_empty() {
            return Err(PipelineError::Validation("Target user is required".into()));
        }
        if text.is_none() && !has_attachment {
            return Err(PipelineError::Validation(
                "Text or attachment is required".into(),
            ));
        }
        if let Some(text) = text {
            if text.chars().count() > self.config.max_text_length {
                return Err(PipelineError::Validation(format!(
                    "Text exceeds {} characters",
                    self.config.max_text_length
                )));
            }
        }
        Ok(())
    }

    async fn load_profiles(&self, pair: &ParticipantPair) -> HashMap<UserId, UserProfile> {
        let mut profiles = HashMap::new();
        for user in pair.users() {
            match self.store.find_user(user).await {
                Ok(Some(profile)) => {
                    profiles.insert(user.clone(), profile);
                }
                Ok(None) => debug!(user = %user, "No profile for participant"),
                Err(e) => warn!(user = %user, error = %e, "Failed to load profile"),
            }
        }
        profiles
    }

    /// Push the live event, plus an unread hint to the recipient's
    /// connections that are not in the room.
    fn route(
        &self,
        sender: &UserId,
        target: &UserId,
        payload: MessagePayload,
        summary: String,
    ) -> usize {
        let room = RoomId::for_pair(sender, target);
        let sender_name = payload.sender_name();

        let delivered = match self.config.delivery_mode {
            DeliveryMode::Room => self
                .hub
                .router
                .broadcast_to_room(&room, ServerEvent::MessageReceived(payload)),
            DeliveryMode::GlobalDegraded => self
                .hub
                .router
                .broadcast_global(ServerEvent::MessageReceived(payload)),
        };

        let in_room = self.hub.router.room_members(&room);
        let elsewhere: Vec<_> = self
            .hub
            .presence
            .connections_of(target)
            .into_iter()
            .filter(|id| !in_room.contains(id))
            .collect();
        if !elsewhere.is_empty() {
            self.hub.router.send_to(
                &elsewhere,
                ServerEvent::MessageNotification {
                    sender_id: sender.to_string(),
                    sender_name,
                    message: summary,
                },
            );
        }

        debug!(room = %room, recipients = delivered, hints = elsewhere.len(), "Message routed");
        delivered
    }

    /// Check the cheap rules now; run the lookup and send in the background.
    fn schedule_notification(
        &self,
        conversation: &Conversation,
        recipient: &UserId,
        body: NotificationBody,
    ) -> NotificationHandle {
        let now = Utc::now();
        let online = self.hub.presence.is_online(recipient);

        if let Some(reason) = self
            .decider
            .precheck(online, conversation.last_notified_at, now)
        {
            debug!(
                conversation = %conversation.id,
                recipient = %recipient,
                reason = reason.as_str(),
                "Notification skipped"
            );
            return NotificationHandle::Ready(NotificationOutcome::Skipped(reason));
        }

        let task = NotificationTask {
            store: Arc::clone(&self.store),
            notifier: Arc::clone(&self.notifier),
            decider: self.decider.clone(),
            subject: self.config.notification_subject.clone(),
            timeout: self.config.notification_timeout,
            conversation: conversation.id.clone(),
            last_notified_at: conversation.last_notified_at,
            recipient: recipient.clone(),
            body,
            now,
        };
        NotificationHandle::Pending(tokio::spawn(task.run()))
    }
}

/// Background half of the notification step.
struct NotificationTask {
    store: Arc<dyn ChatStore>,
    notifier: Arc<dyn Notifier>,
    decider: NotificationDecider,
    subject: String,
    timeout: Duration,
    conversation: ConversationId,
    last_notified_at: Option<DateTime<Utc>>,
    recipient: UserId,
    body: NotificationBody,
    now: DateTime<Utc>,
}

impl NotificationTask {
    async fn run(self) -> NotificationOutcome {
        let contact = match self.store.find_user(&self.recipient).await {
            Ok(profile) => profile.and_then(|p| p.contact_address().map(str::to_string)),
            Err(e) => {
                warn!(recipient = %self.recipient, error = %e, "Failed to load recipient");
                return NotificationOutcome::Failed(e.to_string());
            }
        };

        // Presence was checked when the message was sent.
        let address = match self.decider.decide(
            false,
            self.last_notified_at,
            self.now,
            contact.as_deref(),
        ) {
            Decision::Send { address } => address,
            Decision::Skip(reason) => {
                debug!(recipient = %self.recipient, reason = reason.as_str(), "Notification skipped");
                return NotificationOutcome::Skipped(reason);
            }
        };

        let send = self.notifier.send(&address, &self.subject, &self.body);
        let result = match tokio::time::timeout(self.timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout(self.timeout)),
        };

        // An attempt starts the cooldown whether or not it was delivered.
        if let Err(e) = self.store.set_last_notified(&self.conversation, self.now).await {
            warn!(conversation = %self.conversation, error = %e, "Failed to record notification time");
        }

        if let Err(e) = result {
            warn!(
                conversation = %self.conversation,
                recipient = %self.recipient,
                notifier = self.notifier.name(),
                error = %e,
                "Notification failed"
            );
            return NotificationOutcome::Failed(e.to_string());
        }

        info!(
            conversation = %self.conversation,
            recipient = %self.recipient,
            notifier = self.notifier.name(),
            "Offline notification sent"
        );
        NotificationOutcome::Sent
    }
}

fn with_message(mut conversation: Conversation, message: &Message) -> Conversation {
    conversation.messages.push(message.clone());
    conversation
}

fn populate(conversation: &Conversation, profiles: &HashMap<UserId, UserProfile>) -> ConversationView {
    ConversationView {
        id: conversation.id.clone(),
        participants: conversation.participants.clone(),
        messages: conversation
            .messages
            .iter()
            .map(|message| MessageView {
                id: message.id.clone(),
                sender: SenderSummary::from_profile(&message.sender, profiles.get(&message.sender)),
                text: message.text.clone(),
                attachment: message.attachment.clone(),
                created_at: message.created_at,
            })
            .collect(),
        last_notified_at: conversation.last_notified_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::{FailingNotifier, RecordingNotifier, StalledNotifier};
    use crate::router::{ConnectionId, Inbox};
    use crate::session::ConnectionSession;
    use crate::store::testing::UnavailableStore;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        hub: Arc<Hub>,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        pipeline: MessagePipeline,
    }

    fn profile(id: &str, first: &str, email: Option<&str>) -> UserProfile {
        UserProfile {
            id: id.into(),
            first_name: first.into(),
            last_name: "Tester".into(),
            email: email.map(str::to_string),
            last_active: None,
        }
    }

    fn fixture_with(config: PipelineConfig) -> Fixture {
        let hub = Arc::new(Hub::new());
        let store = Arc::new(MemoryStore::new());
        store.upsert_user(profile("alice", "Alice", Some("alice@example.com")));
        store.upsert_user(profile("bob", "Bob", Some("bob@example.com")));
        store.upsert_user(profile("carol", "Carol", Some("carol@example.com")));
        store.upsert_user(profile("dave", "Dave", None));

        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline = MessagePipeline::new(
            Arc::clone(&hub),
            store.clone(),
            notifier.clone(),
            config,
        );
        Fixture {
            hub,
            store,
            notifier,
            pipeline,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(PipelineConfig::default())
    }

    fn connect(hub: &Hub, conn: &str, user: &str, target: &str) -> (ConnectionSession, Inbox) {
        let (mut session, inbox) = ConnectionSession::open(hub, ConnectionId::from(conn)).unwrap();
        session.join(hub, user, user.into(), target.into()).unwrap();
        (session, inbox)
    }

    fn drain(inbox: &mut Inbox) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = inbox.try_recv() {
            events.push(envelope.event.clone());
        }
        events
    }

    fn received(events: &[ServerEvent]) -> Vec<&MessagePayload> {
        events
            .iter()
            .filter_map(|event| match event {
                ServerEvent::MessageReceived(payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_send_creates_one_conversation() {
        let f = fixture();

        let delivery = f
            .pipeline
            .send(SendRequest::text("alice", "bob", "hello"))
            .await
            .unwrap();

        assert_eq!(f.store.conversation_count(), 1);
        assert_eq!(delivery.conversation.messages.len(), 1);
        assert_eq!(delivery.message.text.as_deref(), Some("hello"));
        assert_eq!(delivery.conversation.messages[0].sender.first_name, "Alice");
    }

    #[tokio::test]
    async fn test_reply_appends_to_same_conversation() {
        let f = fixture();

        let first = f
            .pipeline
            .send(SendRequest::text("alice", "bob", "hello"))
            .await
            .unwrap();
        let second = f
            .pipeline
            .send(SendRequest::text("bob", "alice", "hey"))
            .await
            .unwrap();

        assert_eq!(first.conversation.id, second.conversation.id);
        assert_eq!(f.store.conversation_count(), 1);
        assert_eq!(second.conversation.messages.len(), 2);
        assert_eq!(second.conversation.messages[1].sender.first_name, "Bob");
    }

    #[tokio::test]
    async fn test_empty_send_is_rejected() {
        let f = fixture();

        for text in [None, Some(String::new()), Some("   ".to_string())] {
            let result = f
                .pipeline
                .send(SendRequest {
                    sender: "alice".into(),
                    target: "bob".into(),
                    text,
                    attachment: None,
                })
                .await;
            assert!(matches!(result, Err(PipelineError::Validation(_))));
        }
        assert_eq!(f.store.conversation_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_text_is_rejected() {
        let f = fixture_with(PipelineConfig {
            max_text_length: 5,
            ..PipelineConfig::default()
        });

        let result = f
            .pipeline
            .send(SendRequest::text("alice", "bob", "toolong"))
            .await;
        assert!(matches!(result, Err(PipelineError::Validation(_))));
        assert_eq!(f.store.conversation_count(), 0);
    }

    #[tokio::test]
    async fn test_joined_peer_receives_message_and_no_notification() {
        let f = fixture();
        let (_alice, mut alice_inbox) = connect(&f.hub, "conn-a", "alice", "bob");
        let (_bob, mut bob_inbox) = connect(&f.hub, "conn-b", "bob", "alice");
        drain(&mut alice_inbox);
        drain(&mut bob_inbox);

        let delivery = f
            .pipeline
            .send(SendRequest::text("alice", "bob", "hi"))
            .await
            .unwrap();
        assert_eq!(delivery.recipients, 2);

        let events = drain(&mut bob_inbox);
        let payloads = received(&events);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].text.as_deref(), Some("hi"));
        assert_eq!(payloads[0].first_name, "Alice");
        assert_eq!(payloads[0].sender_id, "alice");

        assert_eq!(
            delivery.notification.outcome().await,
            NotificationOutcome::Skipped(SkipReason::RecipientOnline)
        );
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_offline_recipient_notified_once_per_cooldown() {
        let f = fixture();

        let first = f
            .pipeline
            .send(SendRequest::text("alice", "carol", "are you there?"))
            .await
            .unwrap();
        assert_eq!(first.notification.outcome().await, NotificationOutcome::Sent);

        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].address, "carol@example.com");
        assert_eq!(sent[0].subject, "New Message on Tether");
        assert_eq!(sent[0].body.sender_name, "Alice Tester");
        assert_eq!(sent[0].body.message, "are you there?");

        let conversation_id = first.conversation.id.clone();
        let stored = f
            .store
            .get_conversation(&conversation_id)
            .await
            .unwrap()
            .unwrap();
        let notified_at = stored.last_notified_at.expect("notification time recorded");

        // A few minutes later: still cooling down.
        let second = f
            .pipeline
            .send(SendRequest::text("alice", "carol", "hello?"))
            .await
            .unwrap();
        assert!(matches!(
            second.notification.outcome().await,
            NotificationOutcome::Skipped(SkipReason::CoolingDown { .. })
        ));
        assert_eq!(f.notifier.sent().len(), 1);

        // 61 minutes later.
        f.store
            .set_last_notified(&conversation_id, notified_at - ChronoDuration::minutes(61))
            .await
            .unwrap();
        let third = f
            .pipeline
            .send(SendRequest::text("alice", "carol", "ping"))
            .await
            .unwrap();
        assert_eq!(third.notification.outcome().await, NotificationOutcome::Sent);
        assert_eq!(f.notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_recipient_without_address_is_skipped() {
        let f = fixture();
        let delivery = f
            .pipeline
            .send(SendRequest::text("alice", "dave", "hi"))
            .await
            .unwrap();
        assert_eq!(
            delivery.notification.outcome().await,
            NotificationOutcome::Skipped(SkipReason::NoContactAddress)
        );
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_attachment_only_message() {
        let f = fixture();
        let delivery = f
            .pipeline
            .send(SendRequest {
                sender: "alice".into(),
                target: "carol".into(),
                text: None,
                attachment: Some(Attachment {
                    path: "uploads/cat.png".into(),
                    filename: "cat.png".into(),
                    content_type: Some("image/png".into()),
                    size: 2048,
                }),
            })
            .await
            .unwrap();

        assert!(delivery.message.text.is_none());
        delivery.notification.outcome().await;
        assert_eq!(
            f.notifier.sent()[0].body.message,
            "Sent you an attachment: cat.png"
        );
    }

    #[tokio::test]
    async fn test_store_failure_aborts_without_broadcast() {
        let hub = Arc::new(Hub::new());
        let (_bob, mut bob_inbox) = connect(&hub, "conn-b", "bob", "alice");
        drain(&mut bob_inbox);

        let pipeline = MessagePipeline::new(
            Arc::clone(&hub),
            Arc::new(UnavailableStore),
            Arc::new(RecordingNotifier::default()),
            PipelineConfig::default(),
        );

        let result = pipeline.send(SendRequest::text("alice", "bob", "hi")).await;
        assert!(matches!(result, Err(PipelineError::Store(_))));
        assert!(drain(&mut bob_inbox).is_empty());
    }

    #[tokio::test]
    async fn test_notifier_failure_does_not_fail_send() {
        let hub = Arc::new(Hub::new());
        let store = Arc::new(MemoryStore::new());
        store.upsert_user(profile("carol", "Carol", Some("carol@example.com")));
        let pipeline = MessagePipeline::new(
            hub,
            store.clone(),
            Arc::new(FailingNotifier),
            PipelineConfig::default(),
        );

        let delivery = pipeline
            .send(SendRequest::text("alice", "carol", "hi"))
            .await
            .unwrap();
        let id = delivery.conversation.id.clone();

        assert!(matches!(
            delivery.notification.outcome().await,
            NotificationOutcome::Failed(_)
        ));
        let stored = store.get_conversation(&id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert!(stored.last_notified_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_notification_still_starts_cooldown() {
        let hub = Arc::new(Hub::new());
        let store = Arc::new(MemoryStore::new());
        store.upsert_user(profile("carol", "Carol", Some("carol@example.com")));
        let pipeline = MessagePipeline::new(
            hub,
            store.clone(),
            Arc::new(FailingNotifier),
            PipelineConfig::default(),
        );

        let first = pipeline
            .send(SendRequest::text("alice", "carol", "hi"))
            .await
            .unwrap();
        assert!(matches!(
            first.notification.outcome().await,
            NotificationOutcome::Failed(_)
        ));

        for text in ["still there?", "hello?", "ping", "bye"] {
            let next = pipeline
                .send(SendRequest::text("alice", "carol", text))
                .await
                .unwrap();
            assert!(matches!(
                next.notification.outcome().await,
                NotificationOutcome::Skipped(SkipReason::CoolingDown { .. })
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_notifier_times_out() {
        let hub = Arc::new(Hub::new());
        let store = Arc::new(MemoryStore::new());
        store.upsert_user(profile("carol", "Carol", Some("carol@example.com")));
        let pipeline = MessagePipeline::new(
            hub,
            store.clone(),
            Arc::new(StalledNotifier),
            PipelineConfig {
                notification_timeout: Duration::from_millis(50),
                ..PipelineConfig::default()
            },
        );

        let delivery = pipeline
            .send(SendRequest::text("alice", "carol", "hi"))
            .await
            .unwrap();
        let id = delivery.conversation.id.clone();
        assert!(delivery.notification.is_pending());

        match delivery.notification.outcome().await {
            NotificationOutcome::Failed(reason) => assert!(reason.contains("timed out")),
            other => panic!("Expected timeout, got {:?}", other),
        }
        let stored = store.get_conversation(&id).await.unwrap().unwrap();
        assert!(stored.last_notified_at.is_some());
    }

    #[tokio::test]
    async fn test_global_mode_reaches_outsiders() {
        let f = fixture_with(PipelineConfig {
            delivery_mode: DeliveryMode::GlobalDegraded,
            ..PipelineConfig::default()
        });
        let (_dave, mut dave_inbox) = connect(&f.hub, "conn-d", "dave", "carol");
        drain(&mut dave_inbox);

        f.pipeline
            .send(SendRequest::text("alice", "bob", "secret"))
            .await
            .unwrap();

        assert_eq!(received(&drain(&mut dave_inbox)).len(), 1);
    }

    #[tokio::test]
    async fn test_room_mode_keeps_outsiders_out() {
        let f = fixture();
        let (_dave, mut dave_inbox) = connect(&f.hub, "conn-d", "dave", "carol");
        drain(&mut dave_inbox);

        f.pipeline
            .send(SendRequest::text("alice", "bob", "secret"))
            .await
            .unwrap();

        assert!(drain(&mut dave_inbox).is_empty());
    }

    #[tokio::test]
    async fn test_recipient_in_other_room_gets_hint() {
        let f = fixture();
        // Bob is online but looking at his chat with Carol.
        let (_bob, mut bob_inbox) = connect(&f.hub, "conn-b", "bob", "carol");
        drain(&mut bob_inbox);

        let delivery = f
            .pipeline
            .send(SendRequest::text("alice", "bob", "psst"))
            .await
            .unwrap();

        assert_eq!(
            drain(&mut bob_inbox),
            vec![ServerEvent::MessageNotification {
                sender_id: "alice".into(),
                sender_name: "Alice Tester".into(),
                message: "psst".into(),
            }]
        );
        assert_eq!(
            delivery.notification.outcome().await,
            NotificationOutcome::Skipped(SkipReason::RecipientOnline)
        );
    }

    #[tokio::test]
    async fn test_fetch_creates_empty_conversation() {
        let f = fixture();

        let view = f.pipeline.fetch(&"alice".into(), &"bob".into()).await.unwrap();
        assert!(view.messages.is_empty());
        assert_eq!(f.store.conversation_count(), 1);

        let again = f.pipeline.fetch(&"bob".into(), &"alice".into()).await.unwrap();
        assert_eq!(view.id, again.id);
    }

    #[tokio::test]
    async fn test_unknown_sender_gets_placeholder_name() {
        let f = fixture();
        let delivery = f
            .pipeline
            .send(SendRequest::text("ghost", "bob", "boo"))
            .await
            .unwrap();
        assert_eq!(delivery.conversation.messages[0].sender.first_name, "Unknown");
    }
}
