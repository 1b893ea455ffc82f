//! Presence tracking for Tether.
//!
//! A user is online while at least one of their connections has joined a
//! room. Presence is counted per connection, so closing one browser tab does
//! not take a user offline while another tab is still open.

use crate::model::UserId;
use crate::router::ConnectionId;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::debug;

/// Process-wide registry of online users.
///
/// Owned by the server state and shared behind an `Arc`. Nothing is
/// persisted: after a restart clients re-announce themselves on reconnect.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    /// Open connections per user.
    users: DashMap<UserId, HashSet<ConnectionId>>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `user` is online through `connection_id`.
    ///
    /// Idempotent. Returns `true` if the user was offline before this call.
    pub fn mark_online(&self, user: &UserId, connection_id: &ConnectionId) -> bool {
        let mut connections = self.users.entry(user.clone()).or_default();
        let was_offline = connections.is_empty();
        connections.insert(connection_id.clone());

        if was_offline {
            debug!(user = %user, connection = %connection_id, "Presence: user online");
        }
        was_offline
    }

    /// Drop `connection_id` from `user`'s open connections.
    ///
    /// Idempotent. Returns `true` if this removed the user's last connection.
    pub fn mark_offline(&self, user: &UserId, connection_id: &ConnectionId) -> bool {
        let emptied = match self.users.get_mut(user) {
            Some(mut connections) => connections.remove(connection_id) && connections.is_empty(),
            None => false,
        };

        if emptied && self.users.remove_if(user, |_, c| c.is_empty()).is_some() {
            debug!(user = %user, connection = %connection_id, "Presence: user offline");
            return true;
        }
        false
    }

    /// Check if a user has at least one open connection.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.users
            .get(user)
            .map(|connections| !connections.is_empty())
            .unwrap_or(false)
    }

    /// Connections currently held by a user.
    #[must_use]
    pub fn connections_of(&self, user: &UserId) -> Vec<ConnectionId> {
        self.users
            .get(user)
            .map(|connections| connections.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of open connections held by a user.
    #[must_use]
    pub fn connection_count(&self, user: &UserId) -> usize {
        self.users.get(user).map(|c| c.len()).unwrap_or(0)
    }

    /// Number of online users.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.users.len()
    }

    /// All online users, sorted.
    #[must_use]
    pub fn snapshot(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.users.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
