//! Event router for Tether.
//!
//! The router owns one outbox per open connection and the membership table
//! of every room. Delivery is fire-and-forget: an event is pushed into each
//! target outbox and the connection's own task writes it to the socket.

use crate::envelope::Envelope;
use crate::room::{Room, RoomId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tether_protocol::ServerEvent;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Receiving half of a connection's outbox.
pub type Inbox = mpsc::UnboundedReceiver<Arc<Envelope>>;

type Outbox = mpsc::UnboundedSender<Arc<Envelope>>;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The connection has no outbox.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection was registered twice.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),

    /// Maximum connections reached.
    #[error("Maximum connections reached")]
    MaxConnectionsReached,
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum number of open connections.
    pub max_connections: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
        }
    }
}

/// Routes events to rooms, to chosen connections, or to everyone.
pub struct BroadcastRouter {
    /// Outboxes indexed by connection.
    connections: DashMap<ConnectionId, Outbox>,
    /// Rooms indexed by id.
    rooms: DashMap<RoomId, Room>,
    /// Rooms each connection is in (connection_id -> room ids).
    memberships: DashMap<ConnectionId, HashSet<RoomId>>,
    config: RouterConfig,
}

impl BroadcastRouter {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            config,
        }
    }

    /// Open an outbox for a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is already registered or the
    /// connection limit is reached.
    pub fn register(&self, connection_id: &ConnectionId) -> Result<Inbox, RouterError> {
        if self.connections.len() >= self.config.max_connections {
            return Err(RouterError::MaxConnectionsReached);
        }

        match self.connections.entry(connection_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RouterError::AlreadyRegistered(connection_id.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::unbounded_channel();
                slot.insert(tx);
                debug!(connection = %connection_id, "Registered connection");
                Ok(rx)
            }
        }
    }

    /// Close a connection's outbox and drop it from every room.
    pub fn unregister(&self, connection_id: &ConnectionId) {
        if let Some((_, rooms)) = self.memberships.remove(connection_id) {
            for room in &rooms {
                self.remove_member(room, connection_id);
            }
        }
        self.connections.remove(connection_id);

        debug!(connection = %connection_id, "Unregistered connection");
    }

    /// Add a connection to a room, creating the room if needed.
    ///
    /// Returns `true` if the connection was not already a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not registered.
    pub fn join_room(&self, connection_id: &ConnectionId, room: &RoomId) -> Result<bool, RouterError> {
        if !self.connections.contains_key(connection_id) {
            return Err(RouterError::UnknownConnection(connection_id.clone()));
        }

        self.memberships
            .entry(connection_id.clone())
            .or_default()
            .insert(room.clone());

        let added = self
            .rooms
            .entry(room.clone())
            .or_insert_with(|| {
                debug!(room = %room, "Creating room");
                Room::new(room.clone())
            })
            .add(connection_id);

        Ok(added)
    }

    /// Remove a connection from a room.
    ///
    /// Returns `true` if the connection was a member. Empty rooms are deleted.
    pub fn leave_room(&self, connection_id: &ConnectionId, room: &RoomId) -> bool {
        let was_listed = self
            .memberships
            .get_mut(connection_id)
            .map(|mut rooms| rooms.remove(room))
            .unwrap_or(false);

        let removed = self.remove_member(room, connection_id);
        was_listed || removed
    }

    fn remove_member(&self, room: &RoomId, connection_id: &ConnectionId) -> bool {
        let removed = self
            .rooms
            .get_mut(room)
            .map(|mut entry| entry.remove(connection_id))
            .unwrap_or(false);

        if self.rooms.remove_if(room, |_, entry| entry.is_empty()).is_some() {
            debug!(room = %room, "Deleted empty room");
        }

        removed
    }

    /// Deliver an event to every member of a room.
    ///
    /// Returns the number of connections the event was queued for.
    pub fn broadcast_to_room(&self, room: &RoomId, event: ServerEvent) -> usize {
        self.deliver_to_room(room, None, event)
    }

    /// Deliver an event to every member of a room except `except`.
    pub fn broadcast_to_room_except(
        &self,
        room: &RoomId,
        except: &ConnectionId,
        event: ServerEvent,
    ) -> usize {
        self.deliver_to_room(room, Some(except), event)
    }

    fn deliver_to_room(
        &self,
        room: &RoomId,
        except: Option<&ConnectionId>,
        event: ServerEvent,
    ) -> usize {
        let members = match self.rooms.get(room) {
            Some(entry) => entry.members(),
            None => {
                trace!(room = %room, event = event.name(), "Broadcast to empty room");
                return 0;
            }
        };

        let mut envelope = Envelope::new(event).with_room(room.clone());
        if let Some(source) = except {
            envelope = envelope.with_source(source.clone());
        }
        let envelope = Arc::new(envelope);

        let targets = members.iter().filter(|id| Some(*id) != except);
        let count = self.push(targets, &envelope);
        trace!(room = %room, event = envelope.name(), recipients = count, "Broadcast to room");
        count
    }

    /// Deliver an event to the given connections.
    pub fn send_to(&self, connection_ids: &[ConnectionId], event: ServerEvent) -> usize {
        let envelope = Arc::new(Envelope::new(event));
        self.push(connection_ids.iter(), &envelope)
    }

    /// Deliver an event to every open connection.
    ///
    /// Fine for presence snapshots. Message content sent this way reaches
    /// every connected client, not just the two participants.
    pub fn broadcast_global(&self, event: ServerEvent) -> usize {
        if event.is_private() {
            warn!(event = event.name(), "Broadcasting private event to all connections");
        }

        let envelope = Arc::new(Envelope::new(event));
        let targets: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        let count = self.push(targets.iter(), &envelope);
        trace!(event = envelope.name(), recipients = count, "Broadcast to all");
        count
    }

    fn push<'a>(
        &self,
        targets: impl Iterator<Item = &'a ConnectionId>,
        envelope: &Arc<Envelope>,
    ) -> usize {
        let mut delivered = 0;
        for id in targets {
            if let Some(outbox) = self.connections.get(id) {
                if outbox.send(Arc::clone(envelope)).is_ok() {
                    delivered += 1;
                } else {
                    trace!(connection = %id, "Outbox closed, dropping event");
                }
            }
        }
        delivered
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn is_registered(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Check if a room currently has members.
    #[must_use]
    pub fn room_exists(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    /// Connections currently in a room.
    #[must_use]
    pub fn room_members(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|entry| entry.members())
            .unwrap_or_default()
    }

    /// Rooms a connection is in.
    #[must_use]
    pub fn connection_rooms(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        self.memberships
            .get(connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            connection_count: self.connections.len(),
            room_count: self.rooms.len(),
            total_memberships: self.memberships.iter().map(|m| m.len()).sum(),
        }
    }
}

impl Default for BroadcastRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Router statistics.
#[derive(Debug, Clone)]
pub struct RouterStats {
    /// Number of open connections.
    pub connection_count: usize,
    /// Number of non-empty rooms.
    pub room_count: usize,
    /// Total number of room memberships.
    pub total_memberships: usize,
}
