//! DPoP proof verification as a resource or authorization server does it.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct VerifiedProof {
    pub header: Value,
    pub claims: Value,
    /// RFC 7638 thumbprint of the embedded key
    pub jkt: String,
}

impl VerifiedProof {
    pub fn nonce(&self) -> Option<&str> {
        self.claims.get("nonce").and_then(Value::as_str)
    }

    pub fn ath(&self) -> Option<&str> {
        self.claims.get("ath").and_then(Value::as_str)
    }
}

pub fn sha256_b64(input: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(input))
}

pub fn decode_segment(segment: &str) -> Result<Value, String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| format!("segment is not base64url: {e}"))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("segment is not JSON: {e}"))
}

/// Check signature, `typ`, key shape, `htm` and `htu` of a proof
pub fn verify_proof(proof: &str, method: &str, url: &str) -> Result<VerifiedProof, String> {
    let header_segment = proof.split('.').next().ok_or("empty proof")?;
    let header = decode_segment(header_segment)?;

    if header["typ"] != "dpop+jwt" {
        return Err(format!("unexpected typ {}", header["typ"]));
    }
    if header["alg"] != "ES256" {
        return Err(format!("unexpected alg {}", header["alg"]));
    }

    let jwk = &header["jwk"];
    if jwk["kty"] != "EC" || jwk["crv"] != "P-256" {
        return Err("jwk is not an EC P-256 key".to_string());
    }
    if jwk.get("d").is_some() {
        return Err("jwk contains private key material".to_string());
    }

    let x = jwk["x"].as_str().ok_or("jwk has no x")?;
    let y = jwk["y"].as_str().ok_or("jwk has no y")?;
    let key = DecodingKey::from_ec_components(x, y).map_err(|e| e.to_string())?;

    let mut validation = Validation::new(Algorithm::ES256);
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp"]);

    let claims = decode::<Value>(proof, &key, &validation)
        .map_err(|e| format!("invalid proof signature: {e}"))?
        .claims;

    if claims["htm"] != method {
        return Err(format!("htm {} does not match {method}", claims["htm"]));
    }
    if claims["htu"] != url {
        return Err(format!("htu {} does not match {url}", claims["htu"]));
    }
    if claims["jti"].as_str().map_or(true, str::is_empty) {
        return Err("proof has no jti".to_string());
    }
    if !claims["iat"].is_i64() {
        return Err("proof has no iat".to_string());
    }

    let canonical = format!(r#"{{"crv":"P-256","kty":"EC","x":"{x}","y":"{y}"}}"#);

    Ok(VerifiedProof {
        header,
        claims,
        jkt: sha256_b64(canonical.as_bytes()),
    })
}
