//! Shared server state and HTTP listener wiring.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::conduit::{ConduitEngine, InMemorySlotStore};
use crate::db::SqliteInvitationStore;
use crate::events::{EventBus, InMemoryEventBus};
use crate::invitation::InvitationStore;
use crate::presence::{run_presence_subscriber, PresenceTracker};

/// Everything an API handler needs, shared behind `Arc` across requests.
pub struct AppState {
    pub invitations: Arc<dyn InvitationStore>,
    pub bus: Arc<dyn EventBus>,
    pub presence: Arc<PresenceTracker>,
    pub engine: ConduitEngine,
}

pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn build_state(&self) -> Result<Arc<AppState>> {
        let invitations: Arc<dyn InvitationStore> = match &self.config.db_path {
            Some(path) => Arc::new(
                SqliteInvitationStore::open(path)
                    .with_context(|| format!("opening invitation database at {path}"))?,
            ),
            None => Arc::new(
                SqliteInvitationStore::open_memory().context("opening in-memory invitation database")?,
            ),
        };

        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let presence = Arc::new(PresenceTracker::new());
        let slots = Arc::new(InMemorySlotStore::new());
        let peer_event_max_wait = Duration::from_secs(self.config.peer_event_max_wait_secs);

        let engine = ConduitEngine::new(invitations.clone(), slots, bus.clone(), peer_event_max_wait);

        tokio::spawn(run_presence_subscriber(presence.clone(), bus.clone()));

        Ok(Arc::new(AppState { invitations, bus, presence, engine }))
    }

    pub async fn run(self) -> Result<()> {
        let listen_addr = self.config.listen_addr.clone();
        let state = self.build_state()?;
        let app = crate::api::router(state);

        let listener = tokio::net::TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("binding {listen_addr}"))?;
        tracing::info!(%listen_addr, "invitation conduit listening");
        axum::serve(listener, app).await.context("serving HTTP API")?;
        Ok(())
    }

    /// Build the router over the configured store without binding a
    /// socket — used by integration tests (pass `db_path: None` for an
    /// in-memory store).
    pub fn test_router(config: Config) -> Result<axum::Router> {
        let server = Server::new(config);
        let state = server.build_state()?;
        Ok(crate::api::router(state))
    }
}
