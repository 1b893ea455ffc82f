//! Per-connection session state.
//!
//! ```text
//!            join              join (rebind)
//! Unbound ─────────▶ Joined ◀───────────────┐
//!    │                 │  └─────────────────┘
//!    │ disconnect      │ disconnect
//!    ▼                 ▼
//!  Closed ◀────────────┘
//! ```
//!
//! A session belongs to exactly one connection task, which handles that
//! connection's events one at a time.

use crate::hub::Hub;
use crate::model::UserId;
use crate::room::RoomId;
use crate::router::{ConnectionId, Inbox, RouterError};
use crate::store::ChatStore;
use chrono::Utc;
use tether_protocol::ServerEvent;
use thiserror::Error;
use tracing::{debug, warn};

/// Session errors. Reported back to the client; the connection stays open.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session has already disconnected.
    #[error("Session is closed")]
    Closed,

    /// The event carried an empty or invalid field.
    #[error("Invalid event: {0}")]
    InvalidEvent(&'static str),

    /// Routing failed.
    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, nothing announced yet.
    Unbound,
    /// Bound to a user and the room shared with their partner.
    Joined {
        user: UserId,
        display_name: String,
        room: RoomId,
    },
    /// Terminal.
    Closed,
}

/// State of one open connection.
#[derive(Debug)]
pub struct ConnectionSession {
    id: ConnectionId,
    state: SessionState,
}

impl ConnectionSession {
    /// Register a new connection with the hub.
    ///
    /// Returns the session and the inbox its task should drain.
    ///
    /// # Errors
    ///
    /// Returns an error if the router refuses the connection.
    pub fn open(hub: &Hub, id: ConnectionId) -> Result<(Self, Inbox), RouterError> {
        let inbox = hub.router.register(&id)?;
        debug!(connection = %id, "Session opened");
        Ok((
            Self {
                id,
                state: SessionState::Unbound,
            },
            inbox,
        ))
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The bound user, once joined.
    #[must_use]
    pub fn user(&self) -> Option<&UserId> {
        match &self.state {
            SessionState::Joined { user, .. } => Some(user),
            _ => None,
        }
    }

    /// The current room, once joined.
    #[must_use]
    pub fn room(&self) -> Option<&RoomId> {
        match &self.state {
            SessionState::Joined { room, .. } => Some(room),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Enter the room shared by `user` and `target`.
    ///
    /// A second join leaves the previous room first, and releases the previous
    /// user's presence if the session is rebound to someone else.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or an id is empty.
    pub fn join(
        &mut self,
        hub: &Hub,
        display_name: &str,
        user: UserId,
        target: UserId,
    ) -> Result<RoomId, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if user.is_empty() {
            return Err(SessionError::InvalidEvent("userId is required"));
        }
        if target.is_empty() {
            return Err(SessionError::InvalidEvent("targetUserId is required"));
        }

        let room = RoomId::for_pair(&user, &target);

        if let SessionState::Joined {
            user: previous_user,
            room: previous_room,
            ..
        } = &self.state
        {
            if *previous_room != room {
                hub.router.leave_room(&self.id, previous_room);
            }
            if *previous_user != user {
                hub.presence.mark_offline(previous_user, &self.id);
            }
        }

        hub.router.join_room(&self.id, &room)?;
        hub.presence.mark_online(&user, &self.id);

        debug!(
            connection = %self.id,
            user = %user,
            name = %display_name,
            room = %room,
            "Joined chat"
        );

        self.state = SessionState::Joined {
            user,
            display_name: display_name.to_string(),
            room: room.clone(),
        };

        hub.broadcast_presence();
        Ok(room)
    }

    /// Tell the other members of the pair's room that `user` is typing.
    ///
    /// Works without a prior join: the room is derived from the pair, and
    /// nothing is delivered if nobody is in it.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or an id is empty.
    pub fn typing(
        &self,
        hub: &Hub,
        user: &UserId,
        target: &UserId,
        is_typing: bool,
    ) -> Result<usize, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if user.is_empty() || target.is_empty() {
            return Err(SessionError::InvalidEvent("userId and targetUserId are required"));
        }

        let room = RoomId::for_pair(user, target);
        let delivered = hub.router.broadcast_to_room_except(
            &room,
            &self.id,
            ServerEvent::UserTyping {
                user_id: user.to_string(),
                is_typing,
            },
        );
        Ok(delivered)
    }

    /// Tear the session down after the transport closed.
    ///
    /// Removes the connection from every room and, if the session was bound,
    /// from presence. Updating the user's last-active time is best-effort.
    /// Calling this twice is a no-op.
    pub async fn disconnect(&mut self, hub: &Hub, store: &dyn ChatStore) {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        if previous == SessionState::Closed {
            return;
        }

        hub.router.unregister(&self.id);

        if let SessionState::Joined { user, .. } = previous {
            if hub.presence.mark_offline(&user, &self.id) {
                hub.broadcast_presence();
            }

            if let Err(e) = store.update_last_active(&user, Utc::now()).await {
                warn!(user = %user, error = %e, "Failed to update last active");
            }
            debug!(connection = %self.id, user = %user, "Session closed");
        } else {
            debug!(connection = %self.id, "Unbound session closed");
        }
    }
}
