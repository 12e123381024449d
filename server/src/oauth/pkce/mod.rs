//! PKCE (RFC 7636) generation and the authorize redirect.

use std::time::Duration;

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::OAuthError;
use crate::state::OAuthConfig;
use crate::store::Storage;

pub const PKCE_TTL: Duration = Duration::from_secs(600);

/// Server-side record of one pending authorization, keyed by `state`.
/// The verifier never leaves the server.
#[derive(Clone, Serialize, Deserialize)]
pub struct PkceRecord {
    pub state: String,
    pub code_verifier: String,
    pub redirect_uri: String,
    pub client_id: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for PkceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceRecord")
            .field("state", &self.state)
            .field("redirect_uri", &self.redirect_uri)
            .field("client_id", &self.client_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

pub fn state_key(state: &str) -> String {
    format!("state:{state}")
}

pub fn pkce_key(state: &str) -> String {
    format!("pkce:{state}")
}

#[derive(Debug, Clone)]
pub struct PkceCodes {
    pub code_verifier: String,
    pub code_challenge: String,
}

impl PkceCodes {
    /// 64 random bytes of verifier (86 base64url chars, inside the 43..=128 range)
    pub fn generate() -> Self {
        let mut bytes = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut bytes);
        let code_verifier = Base64UrlUnpadded::encode_string(&bytes);
        let code_challenge = challenge_for(&code_verifier);

        Self {
            code_verifier,
            code_challenge,
        }
    }
}

/// S256 challenge for a verifier
pub fn challenge_for(code_verifier: &str) -> String {
    Base64UrlUnpadded::encode_string(&Sha256::digest(code_verifier.as_bytes()))
}

#[derive(Serialize)]
struct AuthUrlParams<'a> {
    client_id: &'a str,
    redirect_uri: &'a str,
    response_type: &'static str,
    scope: &'a str,
    state: &'a str,
    code_challenge: &'a str,
    code_challenge_method: &'static str,
}

pub fn build_authorize_url(
    config: &OAuthConfig,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
    code_challenge: &str,
) -> Result<String, OAuthError> {
    let query = serde_urlencoded::to_string(AuthUrlParams {
        client_id,
        redirect_uri,
        response_type: "code",
        scope: &config.scope,
        state,
        code_challenge,
        code_challenge_method: "S256",
    })
    .map_err(|e| OAuthError::validation(format!("Could not encode authorize query: {e}")))?;

    let separator = if config.authorize_endpoint.contains('?') {
        '&'
    } else {
        '?'
    };
    Ok(format!("{}{separator}{query}", config.authorize_endpoint))
}

#[derive(Debug, Clone, Serialize)]
pub struct InitiateResponse {
    pub authorize_url: String,
    pub state: String,
    pub redirect_uri: String,
    pub client_id: String,
}

/// Create and persist a PKCE record, then hand back the authorize URL.
/// The record is written before the URL is returned.
#[tracing::instrument(skip(config, storage))]
pub async fn initiate(
    config: &OAuthConfig,
    storage: &Storage,
    use_dev_redirect: bool,
) -> Result<InitiateResponse, OAuthError> {
    let target = config.redirect_target(use_dev_redirect);
    let state = uuid::Uuid::new_v4().to_string();
    let codes = PkceCodes::generate();

    let record = PkceRecord {
        state: state.clone(),
        code_verifier: codes.code_verifier,
        redirect_uri: target.redirect_uri.clone(),
        client_id: target.client_id.clone(),
        created_at: Utc::now(),
    };

    storage.put_json(&state_key(&state), &record, PKCE_TTL).await?;
    storage.put_json(&pkce_key(&state), &record, PKCE_TTL).await?;

    let authorize_url = build_authorize_url(
        config,
        &target.client_id,
        &target.redirect_uri,
        &state,
        &codes.code_challenge,
    )?;

    tracing::info!(
        state = %state,
        redirect_uri = %target.redirect_uri,
        "Started authorization"
    );

    Ok(InitiateResponse {
        authorize_url,
        state,
        redirect_uri: target.redirect_uri.clone(),
        client_id: target.client_id.clone(),
    })
}

/// Find the pending record for `state`, under either namespace
pub async fn load(storage: &Storage, state: &str) -> Result<Option<PkceRecord>, OAuthError> {
    if let Some(record) = storage.get_json(&state_key(state)).await? {
        return Ok(Some(record));
    }
    Ok(storage.get_json(&pkce_key(state)).await?)
}

/// Drop both keys for a consumed `state`
pub async fn consume(storage: &Storage, state: &str) -> Result<(), OAuthError> {
    storage.delete(&state_key(state)).await?;
    storage.delete(&pkce_key(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn config() -> OAuthConfig {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("OAUTH_ISSUER", "https://auth.example"),
            ("OAUTH_CLIENT_ID", "https://app.example/oauth/client-metadata.json"),
            ("OAUTH_REDIRECT_URI", "https://app.example/callback"),
        ]);
        OAuthConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap()
    }

    fn query_pairs(url: &str) -> HashMap<String, String> {
        reqwest::Url::parse(url)
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn test_challenge_matches_verifier() {
        for _ in 0..8 {
            let codes = PkceCodes::generate();
            assert_eq!(challenge_for(&codes.code_verifier), codes.code_challenge);
            assert!((43..=128).contains(&codes.code_verifier.len()));
            assert!(!codes.code_verifier.contains('='));
        }
    }

    #[tokio::test]
    async fn test_initiate_persists_record_and_hides_verifier() {
        let config = config();
        let storage = Storage::new(Arc::new(MemoryKvStore::default()), None);

        let response = initiate(&config, &storage, false).await.unwrap();
        let params = query_pairs(&response.authorize_url);

        assert!(response
            .authorize_url
            .starts_with("https://auth.example/oauth/authorize?"));
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["state"], response.state);
        assert_eq!(params["scope"], "atproto transition:generic");
        assert_eq!(params["redirect_uri"], "https://app.example/callback");

        let record = load(&storage, &response.state).await.unwrap().unwrap();
        assert_eq!(params["code_challenge"], challenge_for(&record.code_verifier));
        assert!(!response.authorize_url.contains(&record.code_verifier));
        assert!(!params.contains_key("code_verifier"));

        let by_pkce: Option<PkceRecord> = storage.get_json(&pkce_key(&response.state)).await.unwrap();
        assert!(by_pkce.is_some());
    }

    #[tokio::test]
    async fn test_consume_removes_both_keys() {
        let config = config();
        let storage = Storage::new(Arc::new(MemoryKvStore::default()), None);
        let response = initiate(&config, &storage, false).await.unwrap();

        consume(&storage, &response.state).await.unwrap();
        assert!(load(&storage, &response.state).await.unwrap().is_none());
    }

    #[test]
    fn test_debug_omits_verifier() {
        let record = PkceRecord {
            state: "s".into(),
            code_verifier: "super-secret-verifier".into(),
            redirect_uri: "r".into(),
            client_id: "c".into(),
            created_at: Utc::now(),
        };
        assert!(!format!("{record:?}").contains("super-secret-verifier"));
    }
}
