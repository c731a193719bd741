//! Invitation API: `invite_new`/`delete`/`list`/`info` plus the ten
//! conduit-step RPCs, dispatched from a single tagged-command HTTP
//! endpoint keyed on a `cmd` field. Read-only health/info reads also get
//! a couple of plain REST GETs.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::conduit::{ConduitState, Side};
use crate::error::{ConduitError, ExchangeError};
use crate::invitation::{
    DeletedReason, Invitation, InvitationKind, InvitationStatus, OrgId, Profile, Token, UserId,
};
use crate::server::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(api_health))
        .route("/api/v1/invite", post(handle_invite))
        .route("/api/v1/invite/{token}/info", get(api_invite_info))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── shared wire types ───────────────────────────────────────────────────

fn encode_b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn decode_b64(s: &str) -> Result<Vec<u8>, ApiError> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|_| ApiError::BadRequest("payload is not valid base64"))
}

#[derive(Debug, Serialize)]
struct InvitationSummary {
    token: Token,
    kind: InvitationKind,
    greeter_user_id: UserId,
    greeter_human_handle: Option<String>,
    claimer_email: Option<String>,
    created_on: chrono::DateTime<Utc>,
    status: InvitationStatus,
    deleted_on: Option<chrono::DateTime<Utc>>,
    deleted_reason: Option<DeletedReason>,
}

impl InvitationSummary {
    fn from_invitation(inv: &Invitation, ready: bool) -> Self {
        let status = if ready && matches!(inv.status(), InvitationStatus::Idle) {
            InvitationStatus::Ready
        } else {
            inv.status()
        };
        InvitationSummary {
            token: inv.token(),
            kind: inv.kind(),
            greeter_user_id: inv.greeter_user_id().to_string(),
            greeter_human_handle: inv.greeter_human_handle().map(str::to_string),
            claimer_email: inv.claimer_email().map(str::to_string),
            created_on: inv.created_on(),
            status,
            deleted_on: inv.deleted_on(),
            deleted_reason: inv.deleted_reason(),
        }
    }
}

enum ApiError {
    BadRequest(&'static str),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "internal invitation store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal" }))).into_response()
            }
        }
    }
}

/// Conduit-taxonomy errors (`not_found`, `already_deleted`, `invalid_state`,
/// `not_allowed`, `not_implemented`) are carried in the 200 response body —
/// they are protocol outcomes, not transport failures.
fn conduit_error_response(e: ConduitError) -> Response {
    (StatusCode::OK, Json(json!({ "status": e.wire_status() }))).into_response()
}

/// A timed-out wait or infrastructure breakage is a transport-level
/// failure, never a conduit status.
fn exchange_error_response(e: ExchangeError) -> Response {
    match e {
        ExchangeError::Conduit(c) => conduit_error_response(c),
        ExchangeError::Timeout => {
            (StatusCode::GATEWAY_TIMEOUT, Json(json!({ "error": "timed out waiting for peer" }))).into_response()
        }
        ExchangeError::Internal(err) => {
            tracing::error!(error = %err, "internal conduit failure");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal" }))).into_response()
        }
    }
}

// ── health ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn api_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ── invite_info (plain GET, used by clients polling a token they hold) ──

#[derive(Deserialize)]
struct InfoQuery {
    organization_id: OrgId,
}

async fn api_invite_info(
    Path(token): Path<String>,
    Query(q): Query<InfoQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(token) = Token::from_hex(&token) else {
        return conduit_error_response(ConduitError::NotFound);
    };
    invite_info(&state, q.organization_id, token)
}

fn invite_info(state: &AppState, org: OrgId, token: Token) -> Response {
    match state.invitations.get(&org, token) {
        Ok(inv) if inv.is_deleted() => {
            (StatusCode::OK, Json(json!({
                "status": "already_deleted",
                "deleted_on": inv.deleted_on(),
                "deleted_reason": inv.deleted_reason(),
            }))).into_response()
        }
        Ok(inv) => {
            let ready = state.presence.is_ready(&org, token);
            let summary = InvitationSummary::from_invitation(&inv, ready);
            (StatusCode::OK, Json(json!({ "status": "ok", "invitation": summary }))).into_response()
        }
        Err(e) => conduit_error_response(e),
    }
}

// ── tagged-command dispatch ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(tag = "cmd")]
enum InviteRequest {
    #[serde(rename = "invite_new")]
    InviteNew {
        organization_id: OrgId,
        kind: InvitationKind,
        greeter_user_id: UserId,
        greeter_profile: Profile,
        #[serde(default)]
        greeter_human_handle: Option<String>,
        #[serde(default)]
        claimer_email: Option<String>,
        #[serde(default)]
        send_email: bool,
    },
    #[serde(rename = "invite_delete")]
    InviteDelete {
        organization_id: OrgId,
        greeter_user_id: UserId,
        token: Token,
        reason: DeletedReason,
    },
    #[serde(rename = "invite_list")]
    InviteList { organization_id: OrgId, greeter_user_id: UserId },
    #[serde(rename = "invite_info")]
    InviteInfo { organization_id: OrgId, token: Token },

    #[serde(rename = "invite_1_claimer_wait_peer")]
    Invite1ClaimerWaitPeer { organization_id: OrgId, token: Token, payload: String },
    #[serde(rename = "invite_1_greeter_wait_peer")]
    Invite1GreeterWaitPeer { organization_id: OrgId, greeter_user_id: UserId, token: Token, payload: String },

    #[serde(rename = "invite_2a_claimer_send_hashed_nonce")]
    Invite2aClaimerSendHashedNonce { organization_id: OrgId, token: Token, payload: String },
    #[serde(rename = "invite_2a_greeter_get_hashed_nonce")]
    Invite2aGreeterGetHashedNonce { organization_id: OrgId, greeter_user_id: UserId, token: Token },

    #[serde(rename = "invite_2b_greeter_send_nonce")]
    Invite2bGreeterSendNonce { organization_id: OrgId, greeter_user_id: UserId, token: Token, payload: String },
    #[serde(rename = "invite_2b_claimer_send_nonce")]
    Invite2bClaimerSendNonce { organization_id: OrgId, token: Token, payload: String },

    #[serde(rename = "invite_3a_claimer_signify_trust")]
    Invite3aClaimerSignifyTrust { organization_id: OrgId, token: Token },
    #[serde(rename = "invite_3a_greeter_wait_peer_trust")]
    Invite3aGreeterWaitPeerTrust { organization_id: OrgId, greeter_user_id: UserId, token: Token },

    #[serde(rename = "invite_3b_greeter_signify_trust")]
    Invite3bGreeterSignifyTrust { organization_id: OrgId, greeter_user_id: UserId, token: Token },
    #[serde(rename = "invite_3b_claimer_wait_peer_trust")]
    Invite3bClaimerWaitPeerTrust { organization_id: OrgId, token: Token },

    #[serde(rename = "invite_4_greeter_communicate")]
    Invite4GreeterCommunicate { organization_id: OrgId, greeter_user_id: UserId, token: Token, payload: String },
    #[serde(rename = "invite_4_claimer_communicate")]
    Invite4ClaimerCommunicate { organization_id: OrgId, token: Token, payload: String },
}

async fn handle_invite(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InviteRequest>,
) -> Result<Response, ApiError> {
    use InviteRequest::*;

    let response = match req {
        InviteNew {
            organization_id,
            kind,
            greeter_user_id,
            greeter_profile,
            greeter_human_handle,
            claimer_email,
            send_email,
        } => {
            if matches!(kind, InvitationKind::User) {
                if !matches!(greeter_profile, Profile::Admin) {
                    return Ok(conduit_error_response(ConduitError::NotAllowed));
                }
                if send_email {
                    // Accepted for wire compatibility; this deployment has
                    // no mail transport wired up.
                    return Ok(conduit_error_response(ConduitError::NotImplemented));
                }
                if claimer_email.is_none() {
                    return Err(ApiError::BadRequest("claimer_email is required for USER invitations"));
                }
            }
            tracing::info!(org = %organization_id, greeter = %greeter_user_id, ?kind, "invite_new");
            let invitation = state
                .invitations
                .create(&organization_id, kind, &greeter_user_id, greeter_human_handle, claimer_email)
                .map_err(ApiError::Internal)?;
            (StatusCode::OK, Json(json!({
                "status": "ok",
                "token": invitation.token(),
                "created_on": invitation.created_on(),
            }))).into_response()
        }

        InviteDelete { organization_id, greeter_user_id, token, reason } => {
            match state.invitations.delete(&organization_id, &greeter_user_id, token, Utc::now(), reason) {
                Ok(_) => {
                    tracing::info!(org = %organization_id, %token, ?reason, "invite_delete");
                    state.engine.discard_slot(&organization_id, token);
                    state.bus.publish(crate::events::Event::StatusChanged {
                        organization_id: organization_id.clone(),
                        token,
                        status: InvitationStatus::Deleted,
                    });
                    // Wake any in-flight waiter so it observes the deletion
                    // instead of blocking until its own timeout.
                    state.bus.publish(crate::events::Event::ConduitUpdated { organization_id, token });
                    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
                }
                Err(e) => conduit_error_response(e),
            }
        }

        InviteList { organization_id, greeter_user_id } => {
            let invitations = state
                .invitations
                .list(&organization_id, &greeter_user_id)
                .map_err(ApiError::Internal)?;
            let summaries: Vec<InvitationSummary> = invitations
                .iter()
                .map(|inv| {
                    let ready = state.presence.is_ready(&organization_id, inv.token());
                    InvitationSummary::from_invitation(inv, ready)
                })
                .collect();
            (StatusCode::OK, Json(json!({ "status": "ok", "invitations": summaries }))).into_response()
        }

        InviteInfo { organization_id, token } => invite_info(&state, organization_id, token),

        Invite1ClaimerWaitPeer { organization_id, token, payload } => {
            let payload = decode_b64(&payload)?;
            exchange_response(&state, organization_id, Side::Claimer, token, ConduitState::WaitPeers, payload).await
        }
        Invite1GreeterWaitPeer { organization_id, token, payload, .. } => {
            let payload = decode_b64(&payload)?;
            exchange_response(&state, organization_id, Side::Greeter, token, ConduitState::WaitPeers, payload).await
        }

        Invite2aClaimerSendHashedNonce { organization_id, token, payload } => {
            let hashed_nonce = decode_b64(&payload)?;
            match state
                .engine
                .exchange(organization_id.clone(), Side::Claimer, token, ConduitState::ClaimerHashedNonce, hashed_nonce)
                .await
            {
                Ok(_discarded) => {
                    match state
                        .engine
                        .exchange(organization_id, Side::Claimer, token, ConduitState::GreeterNonce, Vec::new())
                        .await
                    {
                        Ok(greeter_nonce) => payload_ok(&greeter_nonce),
                        Err(e) => exchange_error_response(e),
                    }
                }
                Err(e) => exchange_error_response(e),
            }
        }
        Invite2aGreeterGetHashedNonce { organization_id, token, .. } => {
            exchange_response(&state, organization_id, Side::Greeter, token, ConduitState::ClaimerHashedNonce, Vec::new()).await
        }

        Invite2bGreeterSendNonce { organization_id, token, payload, .. } => {
            let nonce = decode_b64(&payload)?;
            match state
                .engine
                .exchange(organization_id.clone(), Side::Greeter, token, ConduitState::GreeterNonce, nonce)
                .await
            {
                Ok(_discarded) => {
                    match state
                        .engine
                        .exchange(organization_id, Side::Greeter, token, ConduitState::ClaimerNonce, Vec::new())
                        .await
                    {
                        Ok(claimer_nonce) => payload_ok(&claimer_nonce),
                        Err(e) => exchange_error_response(e),
                    }
                }
                Err(e) => exchange_error_response(e),
            }
        }
        Invite2bClaimerSendNonce { organization_id, token, payload } => {
            let nonce = decode_b64(&payload)?;
            exchange_response(&state, organization_id, Side::Claimer, token, ConduitState::ClaimerNonce, nonce).await
        }

        Invite3aClaimerSignifyTrust { organization_id, token } => {
            exchange_response(&state, organization_id, Side::Claimer, token, ConduitState::ClaimerTrust, Vec::new()).await
        }
        Invite3aGreeterWaitPeerTrust { organization_id, token, .. } => {
            exchange_response(&state, organization_id, Side::Greeter, token, ConduitState::ClaimerTrust, Vec::new()).await
        }
        Invite3bGreeterSignifyTrust { organization_id, token, .. } => {
            exchange_response(&state, organization_id, Side::Greeter, token, ConduitState::GreeterTrust, Vec::new()).await
        }
        Invite3bClaimerWaitPeerTrust { organization_id, token } => {
            exchange_response(&state, organization_id, Side::Claimer, token, ConduitState::GreeterTrust, Vec::new()).await
        }

        Invite4GreeterCommunicate { organization_id, token, payload, .. } => {
            let payload = decode_b64(&payload)?;
            exchange_response(&state, organization_id, Side::Greeter, token, ConduitState::Communicate, payload).await
        }
        Invite4ClaimerCommunicate { organization_id, token, payload } => {
            let payload = decode_b64(&payload)?;
            exchange_response(&state, organization_id, Side::Claimer, token, ConduitState::Communicate, payload).await
        }
    };

    Ok(response)
}

fn payload_ok(peer_payload: &[u8]) -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok", "payload": encode_b64(peer_payload) }))).into_response()
}

async fn exchange_response(
    state: &AppState,
    org: OrgId,
    side: Side,
    token: Token,
    expected_state: ConduitState,
    payload: Vec<u8>,
) -> Response {
    match state.engine.exchange(org, side, token, expected_state, payload).await {
        Ok(peer_payload) => payload_ok(&peer_payload),
        Err(e) => exchange_error_response(e),
    }
}
