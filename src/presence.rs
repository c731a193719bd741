//! Claimer presence tracker (component F).
//!
//! Soft state: a set of tokens per organization whose claimer is currently
//! observed connected. Populated purely by replaying `status_changed`
//! events — if a backend restarts, its view is empty and re-populates as
//! claimers reconnect and re-announce. Used only to annotate `invite_list`
//! results with a live `READY` status.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::events::{Event, EventBus, Wake};
use crate::invitation::{InvitationStatus, OrgId, Token};

#[derive(Default)]
pub struct PresenceTracker {
    by_org: Mutex<HashMap<OrgId, HashSet<Token>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self, org: &OrgId, token: Token) -> bool {
        self.by_org
            .lock()
            .get(org)
            .is_some_and(|set| set.contains(&token))
    }

    fn apply(&self, event: &Event) {
        if let Event::StatusChanged { organization_id, token, status } = event {
            let mut by_org = self.by_org.lock();
            let set = by_org.entry(organization_id.clone()).or_default();
            match status {
                InvitationStatus::Ready => {
                    set.insert(*token);
                }
                _ => {
                    set.remove(token);
                }
            }
        }
    }
}

/// Runs for the lifetime of the process, replaying `status_changed` events
/// into the tracker. Spawned once from server setup.
pub async fn run_presence_subscriber(tracker: std::sync::Arc<PresenceTracker>, bus: std::sync::Arc<dyn EventBus>) {
    let mut sub = bus.subscribe();
    loop {
        match sub.recv().await {
            Some(Wake::Event(event)) => tracker.apply(&event),
            // A lagged receiver dropped some status_changed events; the
            // tracker is soft state anyway (see module docs), so there's
            // nothing to re-check here beyond continuing to listen.
            Some(Wake::MaybeMissed) => continue,
            None => break,
        }
    }
    tracing::warn!("presence subscriber exiting: event bus closed");
}
