//! SQLite-backed invitation store.
//!
//! Invitations are the only durable state in this crate — conduit slots and
//! presence are process memory, discarded on restart per spec. Uses WAL
//! mode so reads (`list`, `get`) don't block on concurrent writes.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::ConduitError;
use crate::invitation::{
    DeletedReason, Invitation, InvitationCommon, InvitationKind, InvitationStatus, InvitationStore,
    OrgId, Token, UserId,
};

pub struct SqliteInvitationStore {
    conn: Mutex<Connection>,
}

impl SqliteInvitationStore {
    pub fn open<P: AsRef<Path>>(path: P) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    pub fn open_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS invitations (
                organization_id      TEXT NOT NULL,
                token                BLOB NOT NULL,
                kind                 TEXT NOT NULL,
                greeter_user_id      TEXT NOT NULL,
                greeter_human_handle TEXT,
                claimer_email        TEXT,
                created_on           TEXT NOT NULL,
                status               TEXT NOT NULL,
                deleted_on           TEXT,
                deleted_reason       TEXT,
                PRIMARY KEY (organization_id, token)
            );

            CREATE INDEX IF NOT EXISTS idx_invitations_greeter
                ON invitations(organization_id, greeter_user_id);
            ",
        )?;
        Ok(())
    }

    fn row_to_invitation(row: &rusqlite::Row) -> rusqlite::Result<Invitation> {
        let token_bytes: Vec<u8> = row.get("token")?;
        let token_arr: [u8; 16] = token_bytes
            .try_into()
            .map_err(|_| rusqlite::Error::InvalidColumnType(0, "token".into(), rusqlite::types::Type::Blob))?;
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        let created_on: String = row.get("created_on")?;
        let deleted_on: Option<String> = row.get("deleted_on")?;
        let deleted_reason: Option<String> = row.get("deleted_reason")?;
        let claimer_email: Option<String> = row.get("claimer_email")?;

        let common = InvitationCommon {
            organization_id: row.get("organization_id")?,
            token: Token(token_arr),
            greeter_user_id: row.get("greeter_user_id")?,
            greeter_human_handle: row.get("greeter_human_handle")?,
            created_on: parse_ts(&created_on),
            status: match status.as_str() {
                "ready" => InvitationStatus::Ready,
                "deleted" => InvitationStatus::Deleted,
                _ => InvitationStatus::Idle,
            },
            deleted_on: deleted_on.as_deref().map(parse_ts),
            deleted_reason: deleted_reason.as_deref().map(|r| match r {
                "cancelled" => DeletedReason::Cancelled,
                "rotten" => DeletedReason::Rotten,
                _ => DeletedReason::Finished,
            }),
        };

        Ok(match kind.as_str() {
            "device" => Invitation::Device { common },
            _ => Invitation::User { common, claimer_email: claimer_email.unwrap_or_default() },
        })
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

fn kind_str(k: InvitationKind) -> &'static str {
    match k {
        InvitationKind::User => "user",
        InvitationKind::Device => "device",
    }
}

fn reason_str(r: DeletedReason) -> &'static str {
    match r {
        DeletedReason::Finished => "finished",
        DeletedReason::Cancelled => "cancelled",
        DeletedReason::Rotten => "rotten",
    }
}

impl InvitationStore for SqliteInvitationStore {
    fn create(
        &self,
        org: &OrgId,
        kind: InvitationKind,
        greeter_user_id: &UserId,
        greeter_human_handle: Option<String>,
        claimer_email: Option<String>,
    ) -> anyhow::Result<Invitation> {
        let conn = self.conn.lock().unwrap();
        let token = Token::generate();
        let created_on = Utc::now();
        // A DEVICE invitation never carries a claimer_email row value, even
        // if one was passed in — the enum variant built below simply has no
        // field to put it in.
        let claimer_email_row = match kind {
            InvitationKind::User => claimer_email.clone(),
            InvitationKind::Device => None,
        };
        conn.execute(
            "INSERT INTO invitations
                (organization_id, token, kind, greeter_user_id, greeter_human_handle,
                 claimer_email, created_on, status, deleted_on, deleted_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'idle', NULL, NULL)",
            params![
                org,
                token.0.to_vec(),
                kind_str(kind),
                greeter_user_id,
                greeter_human_handle,
                claimer_email_row,
                created_on.to_rfc3339(),
            ],
        )?;
        let common = InvitationCommon {
            organization_id: org.clone(),
            token,
            greeter_user_id: greeter_user_id.clone(),
            greeter_human_handle,
            created_on,
            status: InvitationStatus::Idle,
            deleted_on: None,
            deleted_reason: None,
        };
        Ok(match kind {
            InvitationKind::User => Invitation::User { common, claimer_email: claimer_email.unwrap_or_default() },
            InvitationKind::Device => Invitation::Device { common },
        })
    }

    fn get(&self, org: &OrgId, token: Token) -> Result<Invitation, ConduitError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM invitations WHERE organization_id = ?1 AND token = ?2",
            params![org, token.0.to_vec()],
            Self::row_to_invitation,
        )
        .optional()
        .map_err(|_| ConduitError::NotFound)?
        .ok_or(ConduitError::NotFound)
    }

    fn delete(
        &self,
        org: &OrgId,
        greeter_user_id: &UserId,
        token: Token,
        on: DateTime<Utc>,
        reason: DeletedReason,
    ) -> Result<Invitation, ConduitError> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<Invitation> = conn
            .query_row(
                "SELECT * FROM invitations WHERE organization_id = ?1 AND token = ?2",
                params![org, token.0.to_vec()],
                Self::row_to_invitation,
            )
            .optional()
            .map_err(|_| ConduitError::NotFound)?;

        let mut invitation = match existing {
            Some(inv) if inv.greeter_user_id() == greeter_user_id => inv,
            _ => return Err(ConduitError::NotFound),
        };

        if invitation.is_deleted() {
            return Err(ConduitError::AlreadyDeleted);
        }

        conn.execute(
            "UPDATE invitations SET status = 'deleted', deleted_on = ?1, deleted_reason = ?2
             WHERE organization_id = ?3 AND token = ?4",
            params![on.to_rfc3339(), reason_str(reason), org, token.0.to_vec()],
        )
        .map_err(|_| ConduitError::NotFound)?;

        let common = invitation.common_mut();
        common.status = InvitationStatus::Deleted;
        common.deleted_on = Some(on);
        common.deleted_reason = Some(reason);
        Ok(invitation)
    }

    fn list(&self, org: &OrgId, greeter_user_id: &UserId) -> anyhow::Result<Vec<Invitation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM invitations WHERE organization_id = ?1 AND greeter_user_id = ?2
             ORDER BY created_on ASC, token ASC",
        )?;
        let rows = stmt
            .query_map(params![org, greeter_user_id], Self::row_to_invitation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
