//! Mock PDS that enforces DPoP-bound access tokens on its XRPC routes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::dpop::{decode_segment, sha256_b64, verify_proof};
use crate::{request_base, FIXTURE_DID, FIXTURE_HANDLE};

#[derive(Debug, Clone, Default)]
pub struct PdsConfig {
    /// Answer 401 with this nonce until a proof carries it
    pub require_nonce: Option<String>,
    /// Also advertise the nonce inside `WWW-Authenticate`
    pub nonce_in_www_authenticate: bool,
    /// Challenge every request with a new nonce, so no retry can succeed
    pub challenge_every_request: bool,
}

#[derive(Clone, Default)]
pub struct PdsState {
    config: Arc<PdsConfig>,
    calls: Arc<AtomicUsize>,
    proofs: Arc<Mutex<Vec<Value>>>,
}

impl PdsState {
    pub fn new(config: PdsConfig) -> Self {
        Self {
            config: Arc::new(config),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn proofs(&self) -> Vec<Value> {
        self.proofs.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

pub fn router(state: PdsState) -> Router {
    Router::new()
        .route("/xrpc/com.atproto.server.getSession", get(get_session))
        .route("/xrpc/com.atproto.repo.describeRepo", get(describe_repo))
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_metadata),
        )
        .with_state(state)
}

pub async fn spawn(config: PdsConfig) -> anyhow::Result<(String, PdsState)> {
    let state = PdsState::new(config);
    let url = crate::spawn(router(state.clone())).await?;
    Ok((url, state))
}

fn xrpc_error(status: StatusCode, error: &str, message: &str) -> Response {
    (status, Json(json!({ "error": error, "message": message }))).into_response()
}

/// Authorization and proof checks shared by every XRPC route
fn check_dpop(state: &PdsState, headers: &HeaderMap, path: &str) -> Result<(), Response> {
    state.calls.fetch_add(1, Ordering::SeqCst);

    let access_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("DPoP "))
        .ok_or_else(|| {
            xrpc_error(
                StatusCode::UNAUTHORIZED,
                "AuthMissing",
                "Authorization: DPoP <token> required",
            )
        })?;

    let proof = headers
        .get("DPoP")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| xrpc_error(StatusCode::UNAUTHORIZED, "invalid_dpop_proof", "DPoP proof required"))?;

    let url = format!("{}{path}", request_base(headers));
    let verified = verify_proof(proof, "GET", &url)
        .map_err(|e| xrpc_error(StatusCode::UNAUTHORIZED, "invalid_dpop_proof", &e))?;

    if verified.ath() != Some(sha256_b64(access_token.as_bytes()).as_str()) {
        return Err(xrpc_error(
            StatusCode::UNAUTHORIZED,
            "invalid_dpop_proof",
            "ath does not match access token",
        ));
    }

    // Proof key must be the key the token was bound to
    let bound_jkt = access_token
        .split('.')
        .nth(1)
        .and_then(|segment| decode_segment(segment).ok())
        .and_then(|claims| claims["cnf"]["jkt"].as_str().map(str::to_string));
    if let Some(jkt) = bound_jkt {
        if jkt != verified.jkt {
            return Err(xrpc_error(
                StatusCode::UNAUTHORIZED,
                "invalid_token",
                "DPoP key does not match token binding",
            ));
        }
    }

    if let Ok(mut proofs) = state.proofs.lock() {
        proofs.push(verified.claims.clone());
    }

    let rotating = state
        .config
        .challenge_every_request
        .then(|| format!("rotating-{}", state.calls()));
    if let Some(expected) = rotating.as_ref().or(state.config.require_nonce.as_ref()) {
        if rotating.is_some() || verified.nonce() != Some(expected.as_str()) {
            let www_authenticate = if state.config.nonce_in_www_authenticate {
                format!(r#"DPoP error="use_dpop_nonce", nonce="{expected}""#)
            } else {
                r#"DPoP error="use_dpop_nonce", error_description="Resource server requires nonce in DPoP proof""#.to_string()
            };
            return Err((
                StatusCode::UNAUTHORIZED,
                [
                    ("DPoP-Nonce", expected.clone()),
                    ("WWW-Authenticate", www_authenticate),
                ],
                Json(json!({
                    "error": "use_dpop_nonce",
                    "message": "Resource server requires nonce in DPoP proof",
                })),
            )
                .into_response());
        }
    }

    Ok(())
}

async fn get_session(State(state): State<PdsState>, headers: HeaderMap) -> Response {
    if let Err(response) = check_dpop(&state, &headers, "/xrpc/com.atproto.server.getSession") {
        return response;
    }

    Json(json!({
        "did": FIXTURE_DID,
        "handle": FIXTURE_HANDLE,
        "active": true,
        "emailConfirmed": true,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct DescribeRepoParams {
    repo: Option<String>,
}

async fn describe_repo(
    State(state): State<PdsState>,
    headers: HeaderMap,
    Query(params): Query<DescribeRepoParams>,
) -> Response {
    if let Err(response) = check_dpop(&state, &headers, "/xrpc/com.atproto.repo.describeRepo") {
        return response;
    }

    match params.repo.as_deref() {
        Some(FIXTURE_DID) | Some(FIXTURE_HANDLE) => Json(json!({
            "did": FIXTURE_DID,
            "handle": FIXTURE_HANDLE,
            "handleIsCorrect": true,
            "collections": ["app.bsky.actor.profile", "app.bsky.feed.post"],
        }))
        .into_response(),
        Some(other) => xrpc_error(
            StatusCode::BAD_REQUEST,
            "RepoNotFound",
            &format!("Could not find repo: {other}"),
        ),
        None => xrpc_error(StatusCode::BAD_REQUEST, "InvalidRequest", "repo is required"),
    }
}

async fn protected_resource_metadata(headers: HeaderMap) -> Json<Value> {
    let base = request_base(&headers);
    Json(json!({
        "resource": base,
        "authorization_servers": [std::env::var("AUTH_SERVER_URL").unwrap_or_else(|_| base.clone())],
        "scopes_supported": [],
        "bearer_methods_supported": ["header"],
    }))
}
