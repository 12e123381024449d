//! Authorization-code and refresh-token exchange against the token endpoint.

use serde::Deserialize;

use crate::did::decode_unverified_claims;
use crate::errors::OAuthError;
use crate::oauth::dpop::{sign_proof, ProofParams, UpstreamReply};
use crate::oauth::jwk::DpopKeyPair;
use crate::oauth::pkce;
use crate::oauth::session::{Session, SessionStore};
use crate::oauth::utils::redact;
use crate::state::{AppState, REQUIRED_SCOPE};

/// Longest authorization code accepted before assuming a caller mistake
pub const MAX_CODE_LEN: usize = 2048;

pub const TOKEN_EXCHANGE_FAILED: &str = "TOKEN_EXCHANGE_FAILED";

const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Provider lifetimes above one day are capped to it
pub const MAX_EXPIRES_IN: i64 = 86_400;

const DPOP_TOKEN_TYPE: &str = "DPoP";

/// Token endpoint reply as sent on the wire. Field aliases from non-OAuth2
/// shaped servers are resolved once, in [`RawTokenResponse::normalize`].
#[derive(Debug, Default, Deserialize)]
pub struct RawTokenResponse {
    access_token: Option<String>,
    #[serde(rename = "accessJwt")]
    access_jwt: Option<String>,
    #[serde(rename = "accessToken")]
    access_token_camel: Option<String>,
    refresh_token: Option<String>,
    #[serde(rename = "refreshJwt")]
    refresh_jwt: Option<String>,
    #[serde(rename = "refreshToken")]
    refresh_token_camel: Option<String>,
    token_type: Option<String>,
    expires_in: Option<serde_json::Value>,
    scope: Option<String>,
    sub: Option<String>,
    cnf: Option<Confirmation>,
}

#[derive(Debug, Default, Deserialize)]
struct Confirmation {
    jkt: Option<String>,
}

/// Strict internal token shape
#[derive(Clone, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: i64,
    pub scope: String,
    pub sub: Option<String>,
    pub dpop_jkt: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &self.refresh_token.as_deref().map(redact))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("sub", &self.sub)
            .field("dpop_jkt", &self.dpop_jkt)
            .finish()
    }
}

fn first_non_empty(candidates: [Option<String>; 3]) -> Option<String> {
    candidates.into_iter().flatten().find(|v| !v.is_empty())
}

impl RawTokenResponse {
    /// Alias priority: `access_token`, `accessJwt`, `accessToken` (and the
    /// same order for refresh tokens). `token_type` defaults to `DPoP` and
    /// anything else is rejected. `expires_in` defaults to one hour and is
    /// capped at [`MAX_EXPIRES_IN`].
    pub fn normalize(self) -> Result<TokenResponse, OAuthError> {
        let access_token =
            first_non_empty([self.access_token, self.access_jwt, self.access_token_camel])
                .ok_or_else(|| {
                    OAuthError::InvalidTokenResponse(
                        "token endpoint response has no access token".to_string(),
                    )
                })?;

        let refresh_token = first_non_empty([
            self.refresh_token,
            self.refresh_jwt,
            self.refresh_token_camel,
        ]);

        let expires_in = match self.expires_in {
            Some(serde_json::Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(DEFAULT_EXPIRES_IN),
            Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(DEFAULT_EXPIRES_IN),
            _ => DEFAULT_EXPIRES_IN,
        };
        if expires_in > MAX_EXPIRES_IN {
            tracing::warn!(expires_in, "Token lifetime above one day, capping it");
        }
        let expires_in = expires_in.min(MAX_EXPIRES_IN);

        // The access token is always presented as `Authorization: DPoP`
        match self.token_type.as_deref().map(str::trim) {
            None | Some("") => {}
            Some(t) if t.eq_ignore_ascii_case(DPOP_TOKEN_TYPE) => {}
            Some(other) => {
                return Err(OAuthError::InvalidTokenResponse(format!(
                    "expected a DPoP-bound token, got token_type `{other}`"
                )))
            }
        }

        Ok(TokenResponse {
            access_token,
            refresh_token,
            token_type: DPOP_TOKEN_TYPE.to_string(),
            expires_in,
            scope: self.scope.unwrap_or_default(),
            sub: self.sub.filter(|s| !s.is_empty()),
            dpop_jkt: self.cnf.and_then(|c| c.jkt),
        })
    }
}

impl TokenResponse {
    pub fn has_required_scope(&self) -> bool {
        self.scope.split_whitespace().any(|s| s == REQUIRED_SCOPE)
    }

    /// Reject tokens a session must never be built from
    pub fn ensure_usable(&self, keypair: &DpopKeyPair) -> Result<(), OAuthError> {
        if !self.has_required_scope() {
            return Err(OAuthError::MissingScope {
                required: REQUIRED_SCOPE.to_string(),
                scope: self.scope.clone(),
            });
        }

        if let Some(jkt) = &self.dpop_jkt {
            let expected = keypair.thumbprint()?;
            if *jkt != expected {
                return Err(OAuthError::InvalidTokenResponse(
                    "access token is bound to a different DPoP key".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// `sub` from the response, else from the access token's claims
    pub fn subject(&self) -> Option<String> {
        self.sub.clone().or_else(|| {
            decode_unverified_claims(&self.access_token)
                .ok()
                .and_then(|claims| claims.sub)
        })
    }
}

/// Reject obviously wrong codes before spending a round-trip on them
pub fn validate_code(code: Option<&str>) -> Result<&str, OAuthError> {
    let code = code.map(str::trim).filter(|c| !c.is_empty()).ok_or_else(|| {
        OAuthError::validation("Missing `code`: pass the code from the authorization redirect")
    })?;

    let lower = code.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") || code.contains("oauth/authorize")
    {
        return Err(OAuthError::validation(
            "`code` looks like a URL. Pass only the `code` query parameter from the redirect, not the authorize URL",
        ));
    }

    if code.len() > MAX_CODE_LEN {
        return Err(OAuthError::validation(format!(
            "`code` is {} characters long, the maximum accepted is {MAX_CODE_LEN}",
            code.len()
        )));
    }

    Ok(code)
}

/// Turn a non-OK token endpoint reply into the provider's error, verbatim
fn provider_error(reply: &UpstreamReply) -> OAuthError {
    let error = reply
        .json_str("error")
        .unwrap_or(TOKEN_EXCHANGE_FAILED)
        .to_string();
    let message = reply
        .json_str("error_description")
        .or_else(|| reply.json_str("message"))
        .map(str::to_string)
        .or_else(|| Some(reply.text.trim().to_string()).filter(|t| !t.is_empty()))
        .unwrap_or_else(|| format!("Token endpoint returned HTTP {}", reply.status.as_u16()));

    OAuthError::Provider {
        error,
        message,
        status: reply.status.as_u16(),
    }
}

async fn post_token_form(
    http: &reqwest::Client,
    endpoint: &str,
    form: &[(&str, &str)],
    proof: String,
) -> Result<UpstreamReply, OAuthError> {
    let response = http
        .post(endpoint)
        .header("DPoP", proof)
        .form(form)
        .send()
        .await
        .map_err(|e| OAuthError::network("token endpoint", &e))?;

    UpstreamReply::read(response)
        .await
        .map_err(|e| OAuthError::network("token endpoint", &e))
}

/// POST a token request with a fresh proof. On a nonce challenge, re-sign
/// with the supplied nonce and post the same form exactly once more.
#[tracing::instrument(skip_all, fields(endpoint = %endpoint))]
pub async fn request_token(
    http: &reqwest::Client,
    endpoint: &str,
    keypair: &DpopKeyPair,
    form: &[(&str, &str)],
) -> Result<TokenResponse, OAuthError> {
    let params = ProofParams {
        method: "POST",
        url: endpoint,
        nonce: None,
        access_token: None,
    };

    let proof = sign_proof(keypair, params)?;
    let first = post_token_form(http, endpoint, form, proof).await?;

    let reply = if first.status.is_success() {
        first
    } else if first.is_nonce_challenge() {
        let Some(nonce) = first.nonce() else {
            tracing::warn!(status = %first.status, "Nonce challenge without a nonce value");
            return Err(provider_error(&first));
        };

        tracing::debug!(status = %first.status, "Token endpoint requested a DPoP nonce, retrying once");

        let proof = sign_proof(
            keypair,
            ProofParams {
                nonce: Some(&nonce),
                ..params
            },
        )
        .map_err(|e| OAuthError::NonceRetryFailed(e.to_string()))?;

        post_token_form(http, endpoint, form, proof).await?
    } else {
        first
    };

    if !reply.status.is_success() {
        return Err(provider_error(&reply));
    }

    let raw: RawTokenResponse = serde_json::from_str(&reply.text).map_err(|e| {
        OAuthError::InvalidTokenResponse(format!("token endpoint returned invalid JSON: {e}"))
    })?;
    raw.normalize()
}

/// What the caller hands `/api/atprotocol/token`
#[derive(Debug, Default, Deserialize)]
pub struct ExchangeRequest {
    pub code: Option<String>,
    pub state: Option<String>,
    pub code_verifier: Option<String>,
}

/// Consume a pending authorization and create a session from it.
///
/// Nothing is written unless the whole exchange, including scope and key
/// binding checks, succeeds.
#[tracing::instrument(skip_all)]
pub async fn exchange_authorization_code(
    app: &AppState,
    request: ExchangeRequest,
) -> Result<Session, OAuthError> {
    let code = validate_code(request.code.as_deref())?;
    let state = request
        .state
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let client_verifier = request
        .code_verifier
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let (code_verifier, redirect_uri, client_id) = match (state, client_verifier) {
        (Some(state), _) => {
            let record = pkce::load(&app.storage, state)
                .await?
                .ok_or(OAuthError::StateExpired)?;
            (record.code_verifier, record.redirect_uri, record.client_id)
        }
        (None, Some(verifier)) => {
            let target = &app.config.default_target;
            (
                verifier.to_string(),
                target.redirect_uri.clone(),
                target.client_id.clone(),
            )
        }
        (None, None) => {
            return Err(OAuthError::validation(
                "Missing `state` (or `code_verifier`) for the token exchange",
            ))
        }
    };

    tracing::info!(
        code = %redact(code),
        code_verifier = %redact(&code_verifier),
        state = ?state,
        "Exchanging authorization code"
    );

    let keypair = DpopKeyPair::generate()?;
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri.as_str()),
        ("client_id", client_id.as_str()),
        ("code_verifier", code_verifier.as_str()),
    ];

    let token = request_token(&app.http, &app.config.token_endpoint, &keypair, &form).await?;
    token.ensure_usable(&keypair)?;

    let did = token.subject();
    let session = Session::new(&app.config.issuer, token, &keypair, did)?;
    SessionStore::new(app.storage.clone()).create(&session).await?;

    if let Some(state) = state {
        pkce::consume(&app.storage, state).await?;
    }

    Ok(session)
}

/// Refresh a session's tokens with its own DPoP key, keeping the session id
#[tracing::instrument(skip_all, fields(session_id = %session.session_id))]
pub async fn refresh_session(app: &AppState, session: &Session) -> Result<Session, OAuthError> {
    let refresh_token = session.refresh_token.as_deref().ok_or_else(|| {
        OAuthError::validation("This session has no refresh token, sign in again")
    })?;

    let keypair = session.keypair()?;
    let client_id = &app.config.default_target.client_id;
    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id.as_str()),
    ];

    tracing::info!(refresh_token = %redact(refresh_token), "Refreshing session tokens");

    let token = request_token(&app.http, &app.config.token_endpoint, &keypair, &form).await?;
    token.ensure_usable(&keypair)?;

    let did = token.subject().or_else(|| session.did.clone());
    let refreshed = Session {
        session_id: session.session_id.clone(),
        created_at: session.created_at,
        issuer: session.issuer.clone(),
        access_token: token.access_token,
        refresh_token: token.refresh_token.or_else(|| session.refresh_token.clone()),
        token_type: token.token_type,
        expires_in: token.expires_in,
        scope: token.scope,
        did,
        dpop_private_jwk: session.dpop_private_jwk.clone(),
        dpop_public_jwk: session.dpop_public_jwk.clone(),
    };

    SessionStore::new(app.storage.clone())
        .replace(&refreshed)
        .await?;

    Ok(refreshed)
}
