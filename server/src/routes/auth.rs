use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::auth::{AuthSession, OptionalSession};
use crate::errors::ApiResult;
use crate::oauth::{token, SessionStore};
use crate::state::AppState;

/// Identity check. Never errors: a missing or expired session is
/// `{ authenticated: false }`.
pub async fn me(OptionalSession { session, .. }: OptionalSession) -> Json<Value> {
    match session {
        Some(session) => Json(json!({
            "authenticated": true,
            "session": session.summary(),
        })),
        None => Json(json!({ "authenticated": false })),
    }
}

/// Delete the caller's session whether or not it still exists
pub async fn logout(
    State(state): State<AppState>,
    OptionalSession { session_id, .. }: OptionalSession,
) -> ApiResult<Json<Value>> {
    if let Some(session_id) = session_id {
        SessionStore::new(state.storage.clone())
            .delete(&session_id)
            .await?;
        tracing::info!(session_id = %session_id, "Logged out");
    }

    Ok(Json(json!({ "ok": true })))
}

pub async fn refresh(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> ApiResult<Json<Value>> {
    let refreshed = token::refresh_session(&state, &session).await?;

    Ok(Json(json!({
        "ok": true,
        "sessionId": refreshed.session_id,
        "expires_in": refreshed.expires_in,
        "token_type": refreshed.token_type,
    })))
}
