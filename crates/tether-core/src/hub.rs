//! Shared realtime state.

use crate::presence::PresenceRegistry;
use crate::router::{BroadcastRouter, RouterConfig};
use tether_protocol::ServerEvent;
use tracing::trace;

/// Presence and routing state shared by every session and the message
/// pipeline. One per server; tests build their own.
#[derive(Default)]
pub struct Hub {
    pub presence: PresenceRegistry,
    pub router: BroadcastRouter,
}

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_router_config(config: RouterConfig) -> Self {
        Self {
            presence: PresenceRegistry::new(),
            router: BroadcastRouter::with_config(config),
        }
    }

    /// Send the current online list to every connection.
    pub fn broadcast_presence(&self) -> usize {
        let users = self
            .presence
            .snapshot()
            .into_iter()
            .map(|user| user.to_string())
            .collect::<Vec<_>>();
        let online = users.len();
        let recipients = self.router.broadcast_global(ServerEvent::OnlineUsers(users));
        trace!(online, recipients, "Broadcast presence snapshot");
        recipients
    }
}
