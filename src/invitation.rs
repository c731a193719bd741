//! Invitation records: the durable half of the conduit.
//!
//! An invitation is identified by `(organization_id, token)`. Its lifecycle
//! is entirely store-driven — created once, optionally annotated `READY`
//! by the presence tracker, and deleted exactly once, terminally.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ConduitError;

/// 128-bit opaque invitation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub [u8; 16]);

impl Token {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Token(bytes)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Token(arr))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Token {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Token::from_hex(&s).ok_or_else(|| serde::de::Error::custom("token must be 32 hex chars"))
    }
}

pub type OrgId = String;
pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationKind {
    User,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Idle,
    Ready,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletedReason {
    Finished,
    Cancelled,
    Rotten,
}

/// Authenticated organization member's profile, used to gate which
/// invitation kinds a greeter may create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Admin,
    Standard,
    Outsider,
}

/// Fields every invitation carries regardless of kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationCommon {
    pub organization_id: OrgId,
    pub token: Token,
    pub greeter_user_id: UserId,
    pub greeter_human_handle: Option<String>,
    pub created_on: DateTime<Utc>,
    pub status: InvitationStatus,
    pub deleted_on: Option<DateTime<Utc>>,
    pub deleted_reason: Option<DeletedReason>,
}

/// `Invitation = User | Device`, a sum type over the common prefix fields
/// plus the one field that only makes sense for a USER invitation
/// (`claimer_email`). Kind-specific behavior is by pattern match on this
/// enum, never by an `Option` that could be populated on the wrong variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Invitation {
    User { common: InvitationCommon, claimer_email: String },
    Device { common: InvitationCommon },
}

impl Invitation {
    pub fn common(&self) -> &InvitationCommon {
        match self {
            Invitation::User { common, .. } => common,
            Invitation::Device { common } => common,
        }
    }

    pub fn common_mut(&mut self) -> &mut InvitationCommon {
        match self {
            Invitation::User { common, .. } => common,
            Invitation::Device { common } => common,
        }
    }

    pub fn kind(&self) -> InvitationKind {
        match self {
            Invitation::User { .. } => InvitationKind::User,
            Invitation::Device { .. } => InvitationKind::Device,
        }
    }

    pub fn claimer_email(&self) -> Option<&str> {
        match self {
            Invitation::User { claimer_email, .. } => Some(claimer_email),
            Invitation::Device { .. } => None,
        }
    }

    pub fn organization_id(&self) -> &OrgId {
        &self.common().organization_id
    }

    pub fn token(&self) -> Token {
        self.common().token
    }

    pub fn greeter_user_id(&self) -> &UserId {
        &self.common().greeter_user_id
    }

    pub fn greeter_human_handle(&self) -> Option<&str> {
        self.common().greeter_human_handle.as_deref()
    }

    pub fn created_on(&self) -> DateTime<Utc> {
        self.common().created_on
    }

    pub fn status(&self) -> InvitationStatus {
        self.common().status
    }

    pub fn deleted_on(&self) -> Option<DateTime<Utc>> {
        self.common().deleted_on
    }

    pub fn deleted_reason(&self) -> Option<DeletedReason> {
        self.common().deleted_reason
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.status(), InvitationStatus::Deleted)
    }
}

/// Abstract persistence for invitation records (component A).
///
/// Implementations must make `(organization_id, token)` unique and must
/// never return an absent record as anything other than `NotFound` — a
/// deleted record is a live row with `status = Deleted`, not an absence.
pub trait InvitationStore: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn create(
        &self,
        org: &OrgId,
        kind: InvitationKind,
        greeter_user_id: &UserId,
        greeter_human_handle: Option<String>,
        claimer_email: Option<String>,
    ) -> anyhow::Result<Invitation>;

    fn get(&self, org: &OrgId, token: Token) -> Result<Invitation, ConduitError>;

    fn delete(
        &self,
        org: &OrgId,
        greeter_user_id: &UserId,
        token: Token,
        on: DateTime<Utc>,
        reason: DeletedReason,
    ) -> Result<Invitation, ConduitError>;

    fn list(&self, org: &OrgId, greeter_user_id: &UserId) -> anyhow::Result<Vec<Invitation>>;
}
