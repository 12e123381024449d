use atrium_api::did_doc::DidDocument;
use color_eyre::eyre::{eyre, WrapErr};
use serde::Deserialize;

use crate::oauth::utils::base64_url_decode;
use crate::state::OAuthConfig;

pub const PDS_SERVICE_TYPE: &str = "AtprotoPersonalDataServer";

/// The few access-token claims used as lookup hints. Never trusted for
/// authorization: the signature is not checked here.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct AccessTokenClaims {
    pub sub: Option<String>,
    #[serde(default, deserialize_with = "audience")]
    pub aud: Option<String>,
    pub iss: Option<String>,
}

/// `aud` may be a string or an array of strings
fn audience<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .find_map(|v| v.as_str().map(str::to_string)),
        _ => None,
    })
}

pub fn decode_unverified_claims(token: &str) -> color_eyre::Result<AccessTokenClaims> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| eyre!("Access token is not a JWT"))?;
    let bytes = base64_url_decode(payload).wrap_err("Access token payload is not base64url")?;
    serde_json::from_slice(&bytes).wrap_err("Access token payload is not a JSON object")
}

/// Look up the PDS endpoint in a PLC directory DID document
#[tracing::instrument(skip(http))]
pub async fn resolve_plc_pds(
    http: &reqwest::Client,
    plc_directory_url: &str,
    did: &str,
) -> color_eyre::Result<String> {
    let url = format!("{}/{}", plc_directory_url.trim_end_matches('/'), did);
    let response = http
        .get(&url)
        .send()
        .await
        .wrap_err("Failed to reach PLC directory")?;

    if !response.status().is_success() {
        return Err(eyre!("PLC directory returned {} for {}", response.status(), did));
    }

    let document: DidDocument = response
        .json()
        .await
        .wrap_err("Failed to parse DID document")?;

    pds_endpoint(&document).ok_or_else(|| eyre!("DID document for {did} has no PDS service"))
}

pub fn pds_endpoint(document: &DidDocument) -> Option<String> {
    document
        .service
        .as_ref()?
        .iter()
        .find(|service| service.r#type == PDS_SERVICE_TYPE)
        .map(|service| service.service_endpoint.trim_end_matches('/').to_string())
}

/// Where to send protected calls for an access token: the subject's PDS
/// from the PLC directory, else `aud`, else `iss`, else the configured issuer.
pub async fn resolve_resource_base(
    http: &reqwest::Client,
    config: &OAuthConfig,
    access_token: &str,
) -> String {
    let claims = match decode_unverified_claims(access_token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::debug!(error = %e, "Access token claims unreadable, using configured issuer");
            AccessTokenClaims::default()
        }
    };

    if let Some(sub) = claims.sub.as_deref().filter(|s| s.starts_with("did:plc:")) {
        match resolve_plc_pds(http, &config.plc_directory_url, sub).await {
            Ok(endpoint) => return endpoint,
            Err(e) => {
                tracing::warn!(did = sub, error = %e, "PLC lookup failed, falling back to token claims")
            }
        }
    }

    claims
        .aud
        .into_iter()
        .chain(claims.iss)
        .map(|base| base.trim_end_matches('/').to_string())
        .find(|base| base.starts_with("http://") || base.starts_with("https://"))
        .unwrap_or_else(|| config.issuer.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::utils::base64_url_encode;

    fn fake_jwt(claims: serde_json::Value) -> String {
        format!(
            "{}.{}.sig",
            base64_url_encode(br#"{"alg":"ES256"}"#),
            base64_url_encode(claims.to_string().as_bytes())
        )
    }

    #[test]
    fn test_decode_claims() {
        let token = fake_jwt(serde_json::json!({
            "sub": "did:plc:abc",
            "aud": ["https://pds.example"],
            "iss": "https://auth.example"
        }));
        let claims = decode_unverified_claims(&token).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("did:plc:abc"));
        assert_eq!(claims.aud.as_deref(), Some("https://pds.example"));
        assert_eq!(claims.iss.as_deref(), Some("https://auth.example"));

        assert!(decode_unverified_claims("opaque-token").is_err());
    }

    #[test]
    fn test_pds_endpoint_picks_pds_service() {
        let document: DidDocument = serde_json::from_value(serde_json::json!({
            "id": "did:plc:abc",
            "service": [
                {"id": "#bsky_notif", "type": "BskyNotificationService", "serviceEndpoint": "https://notify.example"},
                {"id": "#atproto_pds", "type": "AtprotoPersonalDataServer", "serviceEndpoint": "https://pds.example/"}
            ]
        }))
        .unwrap();
        assert_eq!(pds_endpoint(&document).as_deref(), Some("https://pds.example"));
    }

    #[tokio::test]
    async fn test_non_plc_subject_falls_back_to_aud_then_iss() {
        let vars = std::collections::HashMap::from([
            ("OAUTH_ISSUER", "https://issuer.example"),
            ("OAUTH_CLIENT_ID", "https://app.example/client"),
            ("OAUTH_REDIRECT_URI", "https://app.example/cb"),
        ]);
        let config = OAuthConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        let http = reqwest::Client::new();

        let token = fake_jwt(serde_json::json!({"sub": "did:web:alice.example", "aud": "https://aud.example"}));
        assert_eq!(
            resolve_resource_base(&http, &config, &token).await,
            "https://aud.example"
        );

        let token = fake_jwt(serde_json::json!({"sub": "did:web:alice.example", "aud": "did:web:pds", "iss": "https://iss.example/"}));
        assert_eq!(
            resolve_resource_base(&http, &config, &token).await,
            "https://iss.example"
        );

        assert_eq!(
            resolve_resource_base(&http, &config, "opaque").await,
            "https://issuer.example"
        );
    }
}
