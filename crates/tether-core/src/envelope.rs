//! Routed events.
//!
//! An [`Envelope`] wraps a server event with routing metadata. Envelopes are
//! shared behind an `Arc`, so a room broadcast allocates the event once.

use crate::room::RoomId;
use crate::router::ConnectionId;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tether_protocol::ServerEvent;

/// A unique envelope identifier.
pub type EnvelopeId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique envelope ID (process-local, monotonically increasing).
#[must_use]
pub fn generate_envelope_id() -> EnvelopeId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// An event on its way to one or more connections.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: EnvelopeId,
    /// Connection that caused the event, if any.
    pub source: Option<ConnectionId>,
    /// Room the event was routed through. `None` for global or targeted sends.
    pub room: Option<RoomId>,
    pub event: ServerEvent,
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    #[must_use]
    pub fn new(event: ServerEvent) -> Self {
        Self {
            id: generate_envelope_id(),
            source: None,
            room: None,
            event,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: ConnectionId) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn with_room(mut self, room: RoomId) -> Self {
        self.room = Some(room);
        self
    }

    /// Time since the envelope was routed. Zero if the clock went backwards.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }

    /// Event name, for logging and metrics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.event.name()
    }
}
