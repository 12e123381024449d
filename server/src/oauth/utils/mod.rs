use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};

/// Helper function to create URL-safe base64 encoding without padding
pub fn base64_url_encode(input: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(input)
}

pub fn base64_url_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(input.trim_end_matches('='))
}

/// base64url(SHA-256(input)), used for PKCE challenges, `ath` and JWK thumbprints
pub fn sha256_base64_url(input: &[u8]) -> String {
    base64_url_encode(&Sha256::digest(input))
}

/// Mask a secret for logging: first and last four characters, or a fixed
/// placeholder when the value is too short to reveal anything safely.
pub fn redact(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() < 12 {
        return "[redacted]".to_string();
    }

    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

/// Current Unix time in seconds
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
