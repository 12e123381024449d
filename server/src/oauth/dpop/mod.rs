//! DPoP proof signing (RFC 9449) and nonce-challenge detection.

use p256::ecdsa::{signature::Signer, Signature};
use rand::{rngs::OsRng, RngCore};
use reqwest::header::HeaderMap;
use serde::Serialize;

use crate::errors::OAuthError;
use crate::oauth::jwk::{DpopKeyPair, EcJwk, ALGORITHM};
use crate::oauth::utils::{base64_url_encode, now_unix, sha256_base64_url};

pub const DPOP_NONCE_HEADER: &str = "DPoP-Nonce";
pub const USE_DPOP_NONCE: &str = "use_dpop_nonce";

/// Proofs are accepted for five minutes after `iat`
const PROOF_LIFETIME_SECS: i64 = 300;

#[derive(Debug, Serialize)]
struct ProofHeader<'a> {
    alg: &'static str,
    typ: &'static str,
    jwk: &'a EcJwk,
}

#[derive(Debug, Serialize)]
pub struct ProofClaims {
    pub jti: String,
    pub htm: String,
    pub htu: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,
}

/// One proof request. `access_token` switches on the `ath` claim used for
/// resource-server calls.
#[derive(Debug, Clone, Copy)]
pub struct ProofParams<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub nonce: Option<&'a str>,
    pub access_token: Option<&'a str>,
}

/// Sign a single-use proof. Every call gets a fresh `jti` and `iat`.
pub fn sign_proof(keypair: &DpopKeyPair, params: ProofParams<'_>) -> Result<String, OAuthError> {
    let jwk = keypair.public_jwk()?;
    jwk.ensure_p256()?;

    let iat = now_unix();
    let claims = ProofClaims {
        jti: generate_jti()?,
        htm: params.method.to_uppercase(),
        htu: proof_target(params.url),
        iat,
        exp: iat + PROOF_LIFETIME_SECS,
        nonce: params.nonce.map(str::to_string),
        ath: params.access_token.map(|t| sha256_base64_url(t.as_bytes())),
    };

    let header = ProofHeader {
        alg: ALGORITHM,
        typ: "dpop+jwt",
        jwk: &jwk,
    };

    let header_json = serde_json::to_vec(&header)
        .map_err(|e| OAuthError::DpopKey(format!("Failed to serialize proof header: {e}")))?;
    let claims_json = serde_json::to_vec(&claims)
        .map_err(|e| OAuthError::DpopKey(format!("Failed to serialize proof claims: {e}")))?;

    let signing_input = format!(
        "{}.{}",
        base64_url_encode(&header_json),
        base64_url_encode(&claims_json)
    );

    let signature: Signature = keypair
        .signing_key()
        .try_sign(signing_input.as_bytes())
        .map_err(|e| OAuthError::DpopKey(format!("Failed to sign DPoP proof: {e}")))?;

    tracing::debug!(
        htm = %claims.htm,
        htu = %claims.htu,
        has_nonce = claims.nonce.is_some(),
        has_ath = claims.ath.is_some(),
        "Signed DPoP proof"
    );

    Ok(format!(
        "{}.{}",
        signing_input,
        base64_url_encode(&signature.to_bytes())
    ))
}

/// A v4 UUID from the OS CSPRNG. No fallback to weaker randomness.
fn generate_jti() -> Result<String, OAuthError> {
    let mut bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| OAuthError::DpopKey(format!("No secure randomness for jti: {e}")))?;
    Ok(uuid::Builder::from_random_bytes(bytes).into_uuid().to_string())
}

/// `htu` is the request URI without query and fragment
pub fn proof_target(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .to_string(),
    }
}

/// Whether a non-OK response is asking for a DPoP nonce
pub fn is_nonce_challenge(headers: &HeaderMap, body: Option<&serde_json::Value>) -> bool {
    let body_asks = body
        .and_then(|b| b.get("error"))
        .and_then(|e| e.as_str())
        .is_some_and(|e| e == USE_DPOP_NONCE);

    body_asks
        || headers.contains_key(DPOP_NONCE_HEADER)
        || www_authenticate_nonce(headers).is_some()
}

/// Pick the nonce to retry with: `WWW-Authenticate` first, then `DPoP-Nonce`,
/// then a `dpop_nonce` field some servers put in the error body.
pub fn extract_nonce(headers: &HeaderMap, body: Option<&serde_json::Value>) -> Option<String> {
    www_authenticate_nonce(headers)
        .or_else(|| {
            headers
                .get(DPOP_NONCE_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
        .or_else(|| {
            body.and_then(|b| b.get("dpop_nonce"))
                .and_then(|n| n.as_str())
                .map(str::to_string)
        })
}

/// A fully read upstream response
#[derive(Debug)]
pub struct UpstreamReply {
    pub status: reqwest::StatusCode,
    pub headers: HeaderMap,
    pub text: String,
    pub json: Option<serde_json::Value>,
}

impl UpstreamReply {
    pub async fn read(response: reqwest::Response) -> Result<Self, reqwest::Error> {
        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await?;
        let json = serde_json::from_str(&text).ok();

        Ok(Self {
            status,
            headers,
            text,
            json,
        })
    }

    pub fn is_nonce_challenge(&self) -> bool {
        is_nonce_challenge(&self.headers, self.json.as_ref())
    }

    pub fn nonce(&self) -> Option<String> {
        extract_nonce(&self.headers, self.json.as_ref())
    }

    pub fn json_str(&self, field: &str) -> Option<&str> {
        self.json
            .as_ref()
            .and_then(|j| j.get(field))
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }
}

fn www_authenticate_nonce(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(reqwest::header::WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(quoted_param_nonce)
}

/// `nonce="..."` as a whole auth-param, so `cnonce="..."` does not match
fn quoted_param_nonce(header: &str) -> Option<String> {
    const PARAM: &str = "nonce=\"";

    header.match_indices(PARAM).find_map(|(idx, _)| {
        let standalone = header[..idx]
            .chars()
            .next_back()
            .map_or(true, |c| c == ',' || c.is_ascii_whitespace());
        if !standalone {
            return None;
        }

        let rest = &header[idx + PARAM.len()..];
        let end = rest.find('"')?;
        Some(rest[..end].to_string()).filter(|n| !n.is_empty())
    })
}
