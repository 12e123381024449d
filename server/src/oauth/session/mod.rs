use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::OAuthError;
use crate::oauth::jwk::{DpopKeyPair, EcJwk};
use crate::oauth::token::TokenResponse;
use crate::oauth::utils::redact;
use crate::store::Storage;

/// Sessions never live shorter than this, whatever the provider says
pub const MIN_SESSION_TTL_SECS: i64 = 60;

pub fn session_key(session_id: &str) -> String {
    format!("sess:{session_id}")
}

/// TTL of a stored session for a token lifetime in seconds
pub fn session_ttl(expires_in: i64) -> Duration {
    Duration::from_secs(expires_in.max(MIN_SESSION_TTL_SECS) as u64)
}

/// A logged-in client. Holds the provider tokens and the exact DPoP keypair
/// the access token is bound to.
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub issuer: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: i64,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,
    pub dpop_private_jwk: EcJwk,
    pub dpop_public_jwk: EcJwk,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("issuer", &self.issuer)
            .field("access_token", &redact(&self.access_token))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("did", &self.did)
            .finish_non_exhaustive()
    }
}

/// What `/api/auth/me` may reveal about a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub issuer: String,
    pub token_type: String,
    pub expires_in: i64,
    pub scope: String,
    pub did: Option<String>,
}

impl Session {
    pub fn new(
        issuer: &str,
        token: TokenResponse,
        keypair: &DpopKeyPair,
        did: Option<String>,
    ) -> Result<Self, OAuthError> {
        Ok(Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            issuer: issuer.to_string(),
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            token_type: token.token_type,
            expires_in: token.expires_in,
            scope: token.scope,
            did,
            dpop_private_jwk: keypair.private_jwk()?,
            dpop_public_jwk: keypair.public_jwk()?,
        })
    }

    /// The keypair this session's access token is bound to
    pub fn keypair(&self) -> Result<DpopKeyPair, OAuthError> {
        DpopKeyPair::from_jwks(&self.dpop_private_jwk, &self.dpop_public_jwk)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            issuer: self.issuer.clone(),
            token_type: self.token_type.clone(),
            expires_in: self.expires_in,
            scope: self.scope.clone(),
            did: self.did.clone(),
        }
    }
}

/// `sess:<id>` records on top of the shared [`Storage`]
#[derive(Clone)]
pub struct SessionStore {
    storage: Storage,
}

impl SessionStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn create(&self, session: &Session) -> Result<String, OAuthError> {
        self.write(session).await?;
        tracing::info!(
            session_id = %session.session_id,
            did = ?session.did,
            expires_in = session.expires_in,
            "Created session"
        );
        Ok(session.session_id.clone())
    }

    /// Overwrite an existing session (same id) with a fresh TTL
    pub async fn replace(&self, session: &Session) -> Result<(), OAuthError> {
        self.write(session).await?;
        tracing::info!(session_id = %session.session_id, "Replaced session");
        Ok(())
    }

    async fn write(&self, session: &Session) -> Result<(), OAuthError> {
        self.storage
            .put_json(
                &session_key(&session.session_id),
                session,
                session_ttl(session.expires_in),
            )
            .await?;
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>, OAuthError> {
        if session_id.is_empty() {
            return Ok(None);
        }
        Ok(self.storage.get_json(&session_key(session_id)).await?)
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), OAuthError> {
        self.storage.delete(&session_key(session_id)).await?;
        Ok(())
    }
}
