//! Offline notifications.
//!
//! When a message arrives for someone with no open connection, the server
//! sends them a notification (email in production). A coarse per-conversation
//! cooldown keeps a burst of offline messages down to one notification.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

/// Default cooldown between notifications for one conversation.
pub const DEFAULT_COOLDOWN_SECS: u64 = 60 * 60;

/// Upper bound accepted for a configured cooldown (one year).
const MAX_COOLDOWN_SECS: u64 = 365 * 24 * 60 * 60;

/// What the notification says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationBody {
    pub sender_name: String,
    pub message: String,
}

/// Notification errors. Logged, never surfaced to the sender.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The send did not finish in time.
    #[error("Notification timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The transport failed.
    #[error("Notification transport failed: {0}")]
    Transport(String),

    /// The receiving service refused the notification.
    #[error("Notification rejected: {0}")]
    Rejected(String),
}

/// Outbound notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification to `address`.
    async fn send(
        &self,
        address: &str,
        subject: &str,
        body: &NotificationBody,
    ) -> Result<(), NotifyError>;

    /// Name used in logs.
    fn name(&self) -> &'static str;
}

/// A notifier that only logs. Used when no mail relay is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        address: &str,
        subject: &str,
        body: &NotificationBody,
    ) -> Result<(), NotifyError> {
        info!(
            to = %address,
            subject = %subject,
            sender = %body.sender_name,
            "Notification (log only)"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Why no notification was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The recipient has an open connection.
    RecipientOnline,
    /// A notification went out recently for this conversation.
    CoolingDown { remaining: Duration },
    /// The recipient has no address to notify.
    NoContactAddress,
}

impl SkipReason {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::RecipientOnline => "recipient_online",
            SkipReason::CoolingDown { .. } => "cooldown",
            SkipReason::NoContactAddress => "no_contact",
        }
    }
}

/// Result of the notification policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Send { address: String },
    Skip(SkipReason),
}

/// The offline-notification policy.
#[derive(Debug, Clone)]
pub struct NotificationDecider {
    cooldown: Duration,
}

impl Default for NotificationDecider {
    fn default() -> Self {
        Self::from_secs(DEFAULT_COOLDOWN_SECS)
    }
}

impl NotificationDecider {
    /// Create a decider with a cooldown in seconds, capped at one year.
    #[must_use]
    pub fn from_secs(cooldown_secs: u64) -> Self {
        Self {
            cooldown: Duration::seconds(cooldown_secs.min(MAX_COOLDOWN_SECS) as i64),
        }
    }

    #[must_use]
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Check the online and cooldown rules.
    ///
    /// These need no I/O, so the pipeline evaluates them at send time.
    #[must_use]
    pub fn precheck(
        &self,
        recipient_online: bool,
        last_notified_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<SkipReason> {
        if recipient_online {
            return Some(SkipReason::RecipientOnline);
        }

        if let Some(last) = last_notified_at {
            let elapsed = now - last;
            if elapsed < self.cooldown {
                return Some(SkipReason::CoolingDown {
                    remaining: self.cooldown - elapsed,
                });
            }
        }

        None
    }

    /// Apply the whole policy: online, then cooldown, then contact address.
    #[must_use]
    pub fn decide(
        &self,
        recipient_online: bool,
        last_notified_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        contact: Option<&str>,
    ) -> Decision {
        if let Some(reason) = self.precheck(recipient_online, last_notified_at, now) {
            return Decision::Skip(reason);
        }

        match contact.map(str::trim).filter(|address| !address.is_empty()) {
            Some(address) => Decision::Send {
                address: address.to_string(),
            },
            None => Decision::Skip(SkipReason::NoContactAddress),
        }
    }
}
