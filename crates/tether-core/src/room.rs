//! Rooms for Tether.
//!
//! Every pair of users shares exactly one room. The room name is derived from
//! the two user ids, so both sides arrive at the same room without any lookup.

use crate::model::{ParticipantPair, UserId};
use crate::router::ConnectionId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

/// Separator placed between the two sorted user ids before hashing.
const PAIR_SEPARATOR: &[u8] = b"_";

/// Identifier of the room shared by two users.
///
/// A hex-encoded SHA-256 digest of the sorted pair, so
/// `RoomId::for_pair(a, b) == RoomId::for_pair(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Derive the room shared by `a` and `b`.
    #[must_use]
    pub fn for_pair(a: &UserId, b: &UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };

        let mut hasher = Sha256::new();
        hasher.update(low.as_str().as_bytes());
        hasher.update(PAIR_SEPARATOR);
        hasher.update(high.as_str().as_bytes());

        Self(hex::encode(hasher.finalize()))
    }

    /// Derive the room for a conversation's participants.
    #[must_use]
    pub fn for_participants(pair: &ParticipantPair) -> Self {
        let [a, b] = pair.users();
        Self::for_pair(a, b)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Membership of a single room.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    members: HashSet<ConnectionId>,
}

impl Room {
    #[must_use]
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: HashSet::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Add a connection. Returns `true` if it was not already a member.
    pub fn add(&mut self, connection_id: &ConnectionId) -> bool {
        let added = self.members.insert(connection_id.clone());
        if added {
            debug!(room = %self.id, connection = %connection_id, "Joined room");
        }
        added
    }

    /// Remove a connection. Returns `true` if it was a member.
    pub fn remove(&mut self, connection_id: &ConnectionId) -> bool {
        let removed = self.members.remove(connection_id);
        if removed {
            debug!(room = %self.id, connection = %connection_id, "Left room");
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains(connection_id)
    }

    #[must_use]
    pub fn members(&self) -> Vec<ConnectionId> {
        self.members.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_is_order_independent() {
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        assert_eq!(RoomId::for_pair(&alice, &bob), RoomId::for_pair(&bob, &alice));
    }

    #[test]
    fn test_room_id_known_digest() {
        let room = RoomId::for_pair(&"bob".into(), &"alice".into());
        assert_eq!(
            room.as_str(),
            "611b6e0ab188c1b2b6ed16d9da695f5729488576753492d068ecbdfe282db569"
        );
        assert_eq!(room.as_str().len(), 64);
    }

    #[test]
    fn test_room_id_distinguishes_partners() {
        let a = UserId::from("64f0a1");
        let b = UserId::from("64f0a2");
        let c = UserId::from("64f0a3");
        assert_ne!(RoomId::for_pair(&a, &b), RoomId::for_pair(&a, &c));
        assert_ne!(RoomId::for_pair(&a, &b), RoomId::for_pair(&b, &c));

        // The separator keeps shifted splits apart.
        assert_ne!(
            RoomId::for_pair(&"ab".into(), &"c".into()),
            RoomId::for_pair(&"a".into(), &"bc".into())
        );
    }

    #[test]
    fn test_room_id_matches_participant_pair() {
        let pair = ParticipantPair::new("bob".into(), "alice".into());
        assert_eq!(
            RoomId::for_participants(&pair),
            RoomId::for_pair(&"alice".into(), &"bob".into())
        );
    }

    #[test]
    fn test_room_membership() {
        let mut room = Room::new(RoomId::for_pair(&"a".into(), &"b".into()));
        let conn = ConnectionId::from("conn-1");

        assert!(room.add(&conn));
        assert!(!room.add(&conn));
        assert_eq!(room.len(), 1);
        assert!(room.contains(&conn));

        assert!(room.remove(&conn));
        assert!(!room.remove(&conn));
        assert!(room.is_empty());
    }
}
