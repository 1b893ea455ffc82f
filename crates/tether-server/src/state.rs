use crate::config::Config;
use crate::notifier;
use anyhow::{Context, Result};
use std::sync::Arc;
use tether_core::{ChatStore, Hub, MemoryStore, MessagePipeline, Notifier};
use tracing::info;

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    /// Presence and room routing.
    pub hub: Arc<Hub>,
    pub store: Arc<dyn ChatStore>,
    pub pipeline: MessagePipeline,
    /// Server configuration.
    pub config: Arc<Config>,
}

impl AppState {
    /// Build the state with an in-memory store seeded from `config.users`.
    ///
    /// # Errors
    ///
    /// Returns an error if the notifier cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let store = MemoryStore::new();
        for profile in &config.users {
            store.upsert_user(profile.clone());
        }
        info!(users = config.users.len(), "Seeded in-memory store");

        let notifier = notifier::from_config(&config.notifications)
            .context("Failed to build notifier")?;

        Ok(Self::with_parts(config, Arc::new(store), notifier))
    }

    #[must_use]
    pub fn with_parts(
        config: Config,
        store: Arc<dyn ChatStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let hub = Arc::new(Hub::with_router_config(config.router_config()));
        let pipeline = MessagePipeline::new(
            Arc::clone(&hub),
            Arc::clone(&store),
            notifier,
            config.pipeline_config(),
        );

        Self {
            hub,
            store,
            pipeline,
            config: Arc::new(config),
        }
    }
}
