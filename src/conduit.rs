//! The conduit state-machine kernel.
//!
//! A [`ConduitEngine`] ties the invitation store, the ephemeral slot store,
//! and the event bus together into one compound operation, [`ConduitEngine::exchange`],
//! built out of an atomic `talk` step followed by one or more atomic `listen`
//! steps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{ConduitError, ExchangeError};
use crate::events::{Event, EventBus, Wake};
use crate::invitation::{InvitationStore, OrgId, Token};

/// The seven conduit states, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConduitState {
    WaitPeers,
    ClaimerHashedNonce,
    GreeterNonce,
    ClaimerNonce,
    ClaimerTrust,
    GreeterTrust,
    Communicate,
}

impl ConduitState {
    /// `Communicate` is self-looping — it's the only state that repeats.
    pub fn next(self) -> ConduitState {
        use ConduitState::*;
        match self {
            WaitPeers => ClaimerHashedNonce,
            ClaimerHashedNonce => GreeterNonce,
            GreeterNonce => ClaimerNonce,
            ClaimerNonce => ClaimerTrust,
            ClaimerTrust => GreeterTrust,
            GreeterTrust => Communicate,
            Communicate => Communicate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Greeter,
    Claimer,
}

/// Ephemeral per-invitation conduit slot.
#[derive(Debug, Clone)]
pub struct Slot {
    pub state: ConduitState,
    pub claimer_payload: Option<Vec<u8>>,
    pub greeter_payload: Option<Vec<u8>>,
    pub claimer_consumed: bool,
    pub greeter_consumed: bool,
}

impl Slot {
    fn fresh() -> Self {
        Slot {
            state: ConduitState::WaitPeers,
            claimer_payload: None,
            greeter_payload: None,
            claimer_consumed: false,
            greeter_consumed: false,
        }
    }

    fn reset_to(&mut self, state: ConduitState) {
        self.state = state;
        self.claimer_payload = None;
        self.greeter_payload = None;
        self.claimer_consumed = false;
        self.greeter_consumed = false;
    }

    fn my_payload(&self, side: Side) -> Option<&[u8]> {
        match side {
            Side::Greeter => self.greeter_payload.as_deref(),
            Side::Claimer => self.claimer_payload.as_deref(),
        }
    }

    fn peer_payload(&self, side: Side) -> Option<&[u8]> {
        match side {
            Side::Greeter => self.claimer_payload.as_deref(),
            Side::Claimer => self.greeter_payload.as_deref(),
        }
    }

    fn set_my_payload(&mut self, side: Side, payload: Vec<u8>) {
        match side {
            Side::Greeter => self.greeter_payload = Some(payload),
            Side::Claimer => self.claimer_payload = Some(payload),
        }
    }

    fn my_consumed_mut(&mut self, side: Side) -> &mut bool {
        match side {
            Side::Greeter => &mut self.greeter_consumed,
            Side::Claimer => &mut self.claimer_consumed,
        }
    }

    fn both_consumed(&self) -> bool {
        self.claimer_consumed && self.greeter_consumed
    }
}

type SlotKey = (OrgId, Token);

/// In-process store of ephemeral conduit slots, one per live invitation.
///
/// Discarded wholesale on process restart — only invitation records
/// survive. A separate lock table serializes `talk`/`listen` per token
/// without contending across unrelated tokens.
pub struct InMemorySlotStore {
    slots: SyncMutex<HashMap<SlotKey, Slot>>,
    locks: SyncMutex<HashMap<SlotKey, Arc<AsyncMutex<()>>>>,
}

impl Default for InMemorySlotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySlotStore {
    pub fn new() -> Self {
        Self {
            slots: SyncMutex::new(HashMap::new()),
            locks: SyncMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &SlotKey) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn get(&self, key: &SlotKey) -> Option<Slot> {
        self.slots.lock().get(key).cloned()
    }

    fn set(&self, key: SlotKey, slot: Slot) {
        self.slots.lock().insert(key, slot);
    }

    /// Drop a slot (and its lock handle) on invitation delete.
    pub fn discard(&self, org: &OrgId, token: Token) {
        let key = (org.clone(), token);
        self.slots.lock().remove(&key);
        self.locks.lock().remove(&key);
    }
}

/// Listen-context handed from `talk` to the subsequent `listen` calls.
struct ListenCtx {
    org: OrgId,
    token: Token,
    side: Side,
    state: ConduitState,
    our_payload: Vec<u8>,
}

/// The conduit engine: `talk` + `listen`, wired to the invitation store,
/// the slot store, and the event bus.
pub struct ConduitEngine {
    invitations: Arc<dyn InvitationStore>,
    slots: Arc<InMemorySlotStore>,
    bus: Arc<dyn EventBus>,
    peer_event_max_wait: Duration,
}

impl ConduitEngine {
    pub fn new(
        invitations: Arc<dyn InvitationStore>,
        slots: Arc<InMemorySlotStore>,
        bus: Arc<dyn EventBus>,
        peer_event_max_wait: Duration,
    ) -> Self {
        Self { invitations, slots, bus, peer_event_max_wait }
    }

    /// Drop a token's ephemeral slot. Called on invitation delete so a
    /// future re-creation of the same token (impossible today, but cheap
    /// to guard against) never inherits stale state.
    pub fn discard_slot(&self, org: &OrgId, token: Token) {
        self.slots.discard(org, token);
    }

    /// `conduit_exchange(org, side, token, expected_state, payload) -> peer_payload`.
    /// Subscribes before `talk` to avoid a lost wakeup, then loops `listen`
    /// against `conduit_updated` events until the peer's payload is
    /// available, bounded by the configured peer-wait timeout.
    pub async fn exchange(
        &self,
        org: OrgId,
        side: Side,
        token: Token,
        expected_state: ConduitState,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, ExchangeError> {
        let mut sub = self.bus.subscribe();

        let body = async {
            let ctx = self.talk(&org, side, token, expected_state, payload).await?;
            loop {
                if let Some(peer_payload) = self.listen(&ctx).await? {
                    return Ok(peer_payload);
                }
                // Wait for a conduit_updated event on this token. Spurious
                // wakes (other tokens) are fine — loop back to listen(),
                // which re-checks state authoritatively. A lagged receiver
                // may have dropped the very event we needed, so it's treated
                // the same as a matching wake rather than skipped.
                loop {
                    match sub.recv().await {
                        Some(Wake::Event(Event::ConduitUpdated { organization_id, token: t }))
                            if organization_id == ctx.org && t == ctx.token =>
                        {
                            break;
                        }
                        Some(Wake::Event(_)) => continue,
                        Some(Wake::MaybeMissed) => break,
                        None => {
                            return Err(ExchangeError::Internal(anyhow::anyhow!(
                                "event bus closed while waiting for peer"
                            )));
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(self.peer_event_max_wait, body).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout),
        }
    }

    /// `talk` step. Atomic under the per-token lock.
    async fn talk(
        &self,
        org: &OrgId,
        side: Side,
        token: Token,
        expected_state: ConduitState,
        payload: Vec<u8>,
    ) -> Result<ListenCtx, ConduitError> {
        let key: SlotKey = (org.clone(), token);
        let lock = self.slots.lock_for(&key);
        let _guard = lock.lock().await;

        let invitation = self.invitations.get(org, token)?;
        if invitation.is_deleted() {
            return Err(ConduitError::AlreadyDeleted);
        }

        let mut slot = self.slots.get(&key).unwrap_or_else(Slot::fresh);

        // State reconciliation: a caller at the expected state redepositing
        // an identical payload is a harmless retry; anything else (a
        // different payload at the same state, or a state mismatch) resets
        // the slot rather than rejecting the call outright — see DESIGN.md.
        if slot.state == expected_state {
            if let Some(existing) = slot.my_payload(side) {
                if existing != payload.as_slice() {
                    slot.reset_to(expected_state);
                }
            }
        } else {
            slot.reset_to(expected_state);
        }

        // Deposit. If the peer already left something for this state, we
        // are the second half of the exchange and have effectively already
        // observed it.
        let peer_already_present = slot.peer_payload(side).is_some();
        slot.set_my_payload(side, payload.clone());
        if peer_already_present {
            *slot.my_consumed_mut(side) = true;
        }

        self.slots.set(key.clone(), slot);
        self.bus.publish(Event::ConduitUpdated { organization_id: org.clone(), token });
        if side == Side::Claimer {
            // Any claimer-side talk is a live signal the claimer is
            // currently connected — the presence tracker reads this back
            // out purely by replaying the event.
            self.bus.publish(Event::StatusChanged {
                organization_id: org.clone(),
                token,
                status: crate::invitation::InvitationStatus::Ready,
            });
        }

        Ok(ListenCtx { org: org.clone(), token, side, state: expected_state, our_payload: payload })
    }

    /// `listen` step. Atomic under the per-token lock.
    async fn listen(&self, ctx: &ListenCtx) -> Result<Option<Vec<u8>>, ConduitError> {
        let key: SlotKey = (ctx.org.clone(), ctx.token);
        let lock = self.slots.lock_for(&key);
        let _guard = lock.lock().await;

        let invitation = self.invitations.get(&ctx.org, ctx.token)?;
        if invitation.is_deleted() {
            return Err(ConduitError::AlreadyDeleted);
        }

        let mut slot = self.slots.get(&key).ok_or(ConduitError::InvalidState)?;

        if slot.state != ctx.state || slot.my_payload(ctx.side) != Some(ctx.our_payload.as_slice()) {
            return Err(ConduitError::InvalidState);
        }

        let peer_payload = match slot.peer_payload(ctx.side) {
            Some(p) => p.to_vec(),
            None => return Ok(None),
        };

        *slot.my_consumed_mut(ctx.side) = true;

        if slot.both_consumed() {
            let next = slot.state.next();
            slot.reset_to(next);
        }

        self.slots.set(key, slot);
        self.bus.publish(Event::ConduitUpdated { organization_id: ctx.org.clone(), token: ctx.token });

        Ok(Some(peer_payload))
    }
}
