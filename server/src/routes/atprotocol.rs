use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::{ApiResult, OAuthError};
use crate::oauth::{pkce, token, ExchangeRequest};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct InitParams {
    /// `dev` selects the development client id / redirect pair
    pub redirect: Option<String>,
}

pub async fn init(
    State(state): State<AppState>,
    Query(params): Query<InitParams>,
) -> ApiResult<Json<pkce::InitiateResponse>> {
    let use_dev_redirect = params.redirect.as_deref() == Some("dev");
    let response = pkce::initiate(&state.config, &state.storage, use_dev_redirect).await?;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
pub struct TokenResult {
    pub ok: bool,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub expires_in: i64,
    pub token_type: String,
}

/// Exchange `{ code, state }` (or `{ code, code_verifier }`) for a session
pub async fn token(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<TokenResult>> {
    let request: ExchangeRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ExchangeRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            OAuthError::validation(format!(
                "Request body must be JSON like {{\"code\": \"...\", \"state\": \"...\"}}: {e}"
            ))
        })?
    };

    let session = token::exchange_authorization_code(&state, request).await?;

    Ok(Json(TokenResult {
        ok: true,
        session_id: session.session_id,
        expires_in: session.expires_in,
        token_type: session.token_type,
    }))
}
