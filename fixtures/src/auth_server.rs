//! Mock OAuth authorization server: authorize redirect and a DPoP-checking
//! token endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::dpop::{sha256_b64, verify_proof};
use crate::{request_base, FIXTURE_DID};

/// How the token endpoint behaves
#[derive(Debug, Clone)]
pub struct AuthServerConfig {
    /// Demand this nonce in proofs, answering `use_dpop_nonce` until it shows up
    pub require_nonce: Option<String>,
    pub scope: String,
    pub expires_in: i64,
    pub sub: String,
    /// Placed in the access token's `aud`
    pub pds_url: Option<String>,
    pub issue_refresh_token: bool,
    /// Echo the proof key thumbprint back as `cnf.jkt`
    pub bind_jkt: bool,
    /// Reply with this body instead of a generated token response
    pub response_override: Option<Value>,
    /// Answer every request with a fresh `use_dpop_nonce` challenge
    pub challenge_every_request: bool,
}

impl Default for AuthServerConfig {
    fn default() -> Self {
        Self {
            require_nonce: None,
            scope: "atproto transition:generic".to_string(),
            expires_in: 3600,
            sub: FIXTURE_DID.to_string(),
            pds_url: None,
            issue_refresh_token: true,
            bind_jkt: true,
            response_override: None,
            challenge_every_request: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct AuthServerState {
    config: Arc<AuthServerConfig>,
    token_calls: Arc<AtomicUsize>,
    /// code -> code_challenge, from authorize requests
    codes: Arc<Mutex<HashMap<String, String>>>,
    proofs: Arc<Mutex<Vec<Value>>>,
    forms: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl AuthServerState {
    pub fn new(config: AuthServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            ..Default::default()
        }
    }

    pub fn token_calls(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }

    /// Claims of every proof that passed verification, in order
    pub fn proofs(&self) -> Vec<Value> {
        self.proofs.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Every form body posted to the token endpoint, in order
    pub fn forms(&self) -> Vec<HashMap<String, String>> {
        self.forms.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

pub fn router(state: AuthServerState) -> Router {
    Router::new()
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server_metadata),
        )
        .route("/oauth/authorize", get(authorize))
        .route("/oauth/token", post(token))
        .with_state(state)
}

/// Spawn on an ephemeral port, returning the base URL and the shared state
pub async fn spawn(config: AuthServerConfig) -> anyhow::Result<(String, AuthServerState)> {
    let state = AuthServerState::new(config);
    let url = crate::spawn(router(state.clone())).await?;
    Ok((url, state))
}

async fn authorization_server_metadata(headers: HeaderMap) -> Json<Value> {
    let base = request_base(&headers);
    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/oauth/authorize"),
        "token_endpoint": format!("{base}/oauth/token"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["none"],
        "dpop_signing_alg_values_supported": ["ES256"],
        "scopes_supported": ["atproto", "transition:generic"],
    }))
}

#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    redirect_uri: String,
    state: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    code_verifier: Option<String>,
}

/// Approve immediately and redirect back with a fresh code
async fn authorize(
    State(state): State<AuthServerState>,
    headers: HeaderMap,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    if params.code_verifier.is_some() {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "code_verifier must not be sent to the authorize endpoint",
        );
    }

    let (Some(challenge), Some("S256")) = (params.code_challenge, params.code_challenge_method.as_deref()) else {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "S256 code_challenge is required",
        );
    };

    let code = format!("code-{}", uuid::Uuid::new_v4());
    if let Ok(mut codes) = state.codes.lock() {
        codes.insert(code.clone(), challenge);
    }

    let mut query = vec![("code", code), ("iss", request_base(&headers))];
    if let Some(s) = params.state {
        query.push(("state", s));
    }
    let query = match serde_urlencoded::to_string(&query) {
        Ok(query) => query,
        Err(e) => return oauth_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", &e.to_string()),
    };

    Redirect::to(&format!("{}?{query}", params.redirect_uri)).into_response()
}

fn oauth_error(status: StatusCode, error: &str, description: &str) -> Response {
    (
        status,
        Json(json!({ "error": error, "error_description": description })),
    )
        .into_response()
}

fn fake_jwt(claims: Value) -> String {
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","typ":"at+jwt"}"#),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
        URL_SAFE_NO_PAD.encode(b"fixture-signature"),
    )
}

async fn token(
    State(state): State<AuthServerState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.token_calls.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut forms) = state.forms.lock() {
        forms.push(form.clone());
    }

    let base = request_base(&headers);
    let config = &state.config;

    let Some(proof) = headers.get("DPoP").and_then(|v| v.to_str().ok()) else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_dpop_proof", "DPoP proof required");
    };

    let verified = match verify_proof(proof, "POST", &format!("{base}/oauth/token")) {
        Ok(verified) => verified,
        Err(e) => return oauth_error(StatusCode::BAD_REQUEST, "invalid_dpop_proof", &e),
    };
    if let Ok(mut proofs) = state.proofs.lock() {
        proofs.push(verified.claims.clone());
    }

    if config.challenge_every_request {
        let nonce = format!("rotating-{}", state.token_calls());
        return (
            StatusCode::BAD_REQUEST,
            [("DPoP-Nonce", nonce)],
            Json(json!({
                "error": "use_dpop_nonce",
                "error_description": "Authorization server requires nonce in DPoP proof",
            })),
        )
            .into_response();
    }

    if let Some(expected) = &config.require_nonce {
        if verified.nonce() != Some(expected.as_str()) {
            return (
                StatusCode::BAD_REQUEST,
                [("DPoP-Nonce", expected.as_str())],
                Json(json!({
                    "error": "use_dpop_nonce",
                    "error_description": "Authorization server requires nonce in DPoP proof",
                })),
            )
                .into_response();
        }
    }

    match form.get("grant_type").map(String::as_str) {
        Some("authorization_code") => {
            let code = form.get("code").cloned().unwrap_or_default();
            let verifier = form.get("code_verifier").cloned().unwrap_or_default();
            if code.is_empty() || verifier.is_empty() || !form.contains_key("redirect_uri") {
                return oauth_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    "code, code_verifier and redirect_uri are required",
                );
            }
            if code == "invalid-code" {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "Invalid code");
            }

            // Codes minted by /oauth/authorize are single use and PKCE checked
            let challenge = state
                .codes
                .lock()
                .ok()
                .and_then(|mut codes| codes.remove(&code));
            if let Some(challenge) = challenge {
                if sha256_b64(verifier.as_bytes()) != challenge {
                    return oauth_error(
                        StatusCode::BAD_REQUEST,
                        "invalid_grant",
                        "code_verifier does not match code_challenge",
                    );
                }
            }
        }
        Some("refresh_token") => {
            let refresh = form.get("refresh_token").cloned().unwrap_or_default();
            if !refresh.starts_with("refresh-") {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "Invalid refresh token");
            }
        }
        other => {
            return oauth_error(
                StatusCode::BAD_REQUEST,
                "unsupported_grant_type",
                &format!("Unsupported grant_type {other:?}"),
            )
        }
    }

    if let Some(body) = &config.response_override {
        return (StatusCode::OK, Json(body.clone())).into_response();
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();

    let mut access_claims = json!({
        "sub": config.sub,
        "iss": base,
        "scope": config.scope,
        "iat": now,
        "exp": now + config.expires_in,
        "jti": uuid::Uuid::new_v4().to_string(),
        "cnf": { "jkt": verified.jkt },
    });
    if let Some(pds) = &config.pds_url {
        access_claims["aud"] = pds.clone().into();
    }

    let mut body = json!({
        "access_token": fake_jwt(access_claims),
        "token_type": "DPoP",
        "expires_in": config.expires_in,
        "scope": config.scope,
        "sub": config.sub,
    });
    if config.issue_refresh_token {
        body["refresh_token"] = format!("refresh-{}", uuid::Uuid::new_v4()).into();
    }
    if config.bind_jkt {
        body["cnf"] = json!({ "jkt": verified.jkt });
    }

    (
        StatusCode::OK,
        [(header::CACHE_CONTROL, "no-store")],
        Json(body),
    )
        .into_response()
}
