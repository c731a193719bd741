//! Conduit error taxonomy.
//!
//! `ConduitError` covers the four protocol-level taxa that are surfaced as
//! distinct wire statuses (plus the two administrative ones used only by
//! `invite_new`). Infrastructure failures belong to `anyhow::Error` instead
//! and never carry a conduit status — callers must be able to tell
//! protocol misuse from an outage.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConduitError {
    #[error("invitation not found")]
    NotFound,
    #[error("invitation already deleted")]
    AlreadyDeleted,
    #[error("conduit state was reset by the peer")]
    InvalidState,
    #[error("operation not allowed for this caller")]
    NotAllowed,
    #[error("feature not implemented")]
    NotImplemented,
}

impl ConduitError {
    /// The wire status string a client sees in the JSON response.
    pub fn wire_status(&self) -> &'static str {
        match self {
            ConduitError::NotFound => "not_found",
            ConduitError::AlreadyDeleted => "already_deleted",
            ConduitError::InvalidState => "invalid_state",
            ConduitError::NotAllowed => "not_allowed",
            ConduitError::NotImplemented => "not_implemented",
        }
    }
}

/// Failures from the exchange loop as a whole, including the two cases
/// that are *not* conduit-taxonomy errors: a peer that never shows up
/// within `PEER_EVENT_MAX_WAIT`, and infrastructure breakage.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Conduit(#[from] ConduitError),
    #[error("timed out waiting for peer")]
    Timeout,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
