use axum::extract::{Query, State};
use reqwest::Method;
use serde::Deserialize;

use crate::auth::AuthSession;
use crate::errors::{ApiResult, OAuthError};
use crate::pds::{fetch_protected, ProtectedResponse};
use crate::state::AppState;

/// `com.atproto.server.getSession` for the signed-in account
pub async fn session(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> ApiResult<ProtectedResponse> {
    fetch_protected(
        &state,
        &session,
        Method::GET,
        "/xrpc/com.atproto.server.getSession",
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct RepoParams {
    pub repo: Option<String>,
}

/// `com.atproto.repo.describeRepo`, defaulting to the session's own DID
pub async fn repo(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Query(params): Query<RepoParams>,
) -> ApiResult<ProtectedResponse> {
    let repo = params
        .repo
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .or_else(|| session.did.clone())
        .ok_or_else(|| OAuthError::validation("Missing `repo` query parameter (a DID or handle)"))?;

    let path = format!(
        "/xrpc/com.atproto.repo.describeRepo?repo={}",
        urlencoding::encode(&repo)
    );
    fetch_protected(&state, &session, Method::GET, &path).await
}
