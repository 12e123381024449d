//! DPoP-bound calls to the user's PDS.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use reqwest::Method;
use serde_json::json;

use crate::did::resolve_resource_base;
use crate::errors::OAuthError;
use crate::oauth::dpop::{sign_proof, ProofParams, UpstreamReply};
use crate::oauth::jwk::DpopKeyPair;
use crate::oauth::session::Session;
use crate::state::AppState;

/// Upstream result, passed through without reinterpretation
#[derive(Debug)]
pub struct ProtectedResponse {
    pub ok: bool,
    pub status: u16,
    pub json: Option<serde_json::Value>,
    pub text: String,
}

impl From<UpstreamReply> for ProtectedResponse {
    fn from(reply: UpstreamReply) -> Self {
        Self {
            ok: reply.status.is_success(),
            status: reply.status.as_u16(),
            json: reply.json,
            text: reply.text,
        }
    }
}

impl ProtectedResponse {
    /// Error message in order of preference: upstream `error`, `message`,
    /// `error_description`, the raw body, then a generic fallback.
    pub fn error_message(&self) -> String {
        let field = |name: &str| {
            self.json
                .as_ref()
                .and_then(|j| j.get(name))
                .and_then(|v| v.as_str())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        field("error")
            .or_else(|| field("message"))
            .or_else(|| field("error_description"))
            .or_else(|| Some(self.text.trim().to_string()).filter(|t| !t.is_empty()))
            .unwrap_or_else(|| format!("Upstream request failed with HTTP {}", self.status))
    }

    pub fn error_code(&self) -> String {
        self.json
            .as_ref()
            .and_then(|j| j.get("error"))
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .unwrap_or("UPSTREAM_ERROR")
            .to_string()
    }
}

/// `{ ok: true, data }` on success, the upstream error shape and status
/// otherwise
impl IntoResponse for ProtectedResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);

        if self.ok {
            let data = self
                .json
                .unwrap_or_else(|| serde_json::Value::String(self.text));
            return (status, Json(json!({ "ok": true, "data": data }))).into_response();
        }

        tracing::warn!(status = self.status, "Upstream protected call failed");
        let body = json!({
            "error": self.error_code(),
            "message": self.error_message(),
            "status": self.status,
        });
        (status, Json(body)).into_response()
    }
}

async fn send_protected(
    http: &reqwest::Client,
    method: &Method,
    url: &str,
    access_token: &str,
    proof: String,
) -> Result<UpstreamReply, OAuthError> {
    let response = http
        .request(method.clone(), url)
        .header(reqwest::header::AUTHORIZATION, format!("DPoP {access_token}"))
        .header("DPoP", proof)
        .send()
        .await
        .map_err(|e| OAuthError::network("resource server", &e))?;

    UpstreamReply::read(response)
        .await
        .map_err(|e| OAuthError::network("resource server", &e))
}

/// One call with a fresh proof, and one more if the server answers 400/401
/// with a nonce challenge
pub async fn fetch_with_nonce_retry(
    http: &reqwest::Client,
    keypair: &DpopKeyPair,
    method: Method,
    url: &str,
    access_token: &str,
) -> Result<ProtectedResponse, OAuthError> {
    let params = ProofParams {
        method: method.as_str(),
        url,
        nonce: None,
        access_token: Some(access_token),
    };

    let proof = sign_proof(keypair, params)?;
    let first = send_protected(http, &method, url, access_token, proof).await?;

    let challenged = matches!(
        first.status,
        reqwest::StatusCode::BAD_REQUEST | reqwest::StatusCode::UNAUTHORIZED
    ) && first.is_nonce_challenge();
    if !challenged {
        return Ok(first.into());
    }

    let Some(nonce) = first.nonce() else {
        return Ok(first.into());
    };

    tracing::debug!(status = %first.status, "Resource server requested a DPoP nonce, retrying once");

    let proof = sign_proof(
        keypair,
        ProofParams {
            nonce: Some(&nonce),
            ..params
        },
    )
    .map_err(|e| OAuthError::NonceRetryFailed(e.to_string()))?;

    Ok(send_protected(http, &method, url, access_token, proof)
        .await?
        .into())
}

/// Call `path` (with query) on the session owner's PDS
#[tracing::instrument(skip(app, session), fields(session_id = %session.session_id))]
pub async fn fetch_protected(
    app: &AppState,
    session: &Session,
    method: Method,
    path: &str,
) -> Result<ProtectedResponse, OAuthError> {
    let keypair = session.keypair()?;
    let base = resolve_resource_base(&app.http, &app.config, &session.access_token).await;
    let url = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));

    let response =
        fetch_with_nonce_retry(&app.http, &keypair, method, &url, &session.access_token).await?;

    tracing::info!(status = response.status, base = %base, "Protected call finished");
    Ok(response)
}
