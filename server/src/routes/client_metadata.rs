use axum::{extract::State, Json};

use crate::state::AppState;

/// Public client metadata for the authorization server. The client has no
/// secret, token requests are bound to per-session DPoP keys instead.
pub async fn client_metadata(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = &state.config;

    let mut redirect_uris = vec![config.default_target.redirect_uri.clone()];
    if let Some(dev) = &config.dev_target {
        redirect_uris.push(dev.redirect_uri.clone());
    }

    Json(serde_json::json!({
        "client_id": config.default_target.client_id,
        "application_type": "web",
        "client_name": "langbird",
        "grant_types": ["authorization_code", "refresh_token"],
        "scope": config.scope,
        "response_types": ["code"],
        "redirect_uris": redirect_uris,
        "dpop_bound_access_tokens": true,
        "token_endpoint_auth_method": "none",
    }))
}
