//! Cross-backend event fan-out (component C).
//!
//! A pub/sub of `conduit_updated` and `status_changed` events. Ordering is
//! best-effort monotonic per token and spurious wakes are fine — callers
//! re-check authoritative state on every wake (see [`crate::conduit`]).
//! The only hard guarantee is no *lost* wakeups for a token with an active
//! waiter.
//!
//! [`InMemoryEventBus`] fans events out within one process via a
//! `tokio::sync::broadcast` channel. A multi-backend deployment would add a
//! second [`EventBus`] implementation that also relays publishes across
//! processes without changing anything in [`crate::conduit`].

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::invitation::{InvitationStatus, OrgId, Token};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    ConduitUpdated {
        organization_id: OrgId,
        token: Token,
    },
    StatusChanged {
        organization_id: OrgId,
        token: Token,
        status: InvitationStatus,
    },
}

/// Channel capacity for the in-memory bus. Sized generously relative to
/// expected concurrent conduits; a lagged subscriber simply re-checks
/// state on its next spurious wake rather than losing correctness.
const CHANNEL_CAPACITY: usize = 4096;

pub trait EventBus: Send + Sync {
    fn publish(&self, event: Event);
    fn subscribe(&self) -> EventSubscription;
}

pub struct InMemoryEventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, event: Event) {
        // No active subscribers is not an error — it just means nobody is
        // waiting on this token right now.
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> EventSubscription {
        EventSubscription(self.tx.subscribe())
    }
}

/// A scoped subscription handle. Dropping it unsubscribes — no weak-
/// reference bookkeeping to manage.
pub struct EventSubscription(broadcast::Receiver<Event>);

/// Outcome of waiting for the next bus event.
pub enum Wake {
    /// An event was delivered.
    Event(Event),
    /// The receiver fell behind and the broadcast channel dropped some
    /// events to catch it up. The caller cannot tell whether the one event
    /// it actually needed was among those dropped, so a lag must be treated
    /// as a wake for every token, not silently skipped — see
    /// [`crate::conduit::ConduitEngine::exchange`].
    MaybeMissed,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<Wake> {
        match self.0.recv().await {
            Ok(event) => Some(Wake::Event(event)),
            Err(broadcast::error::RecvError::Lagged(_)) => Some(Wake::MaybeMissed),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
