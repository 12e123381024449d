use p256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::errors::OAuthError;
use crate::oauth::utils::{base64_url_decode, base64_url_encode, sha256_base64_url};

pub const KEY_TYPE: &str = "EC";
pub const CURVE: &str = "P-256";
pub const ALGORITHM: &str = "ES256";

/// An EC JSON Web Key. `d` is only present on the private half.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
}

impl std::fmt::Debug for EcJwk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcJwk")
            .field("kty", &self.kty)
            .field("crv", &self.crv)
            .field("x", &self.x)
            .field("y", &self.y)
            .field("d", &self.d.as_ref().map(|_| "[redacted]"))
            .field("alg", &self.alg)
            .finish()
    }
}

impl EcJwk {
    /// Fail loudly if the key is not an ES256-compatible P-256 key
    pub fn ensure_p256(&self) -> Result<(), OAuthError> {
        if self.kty != KEY_TYPE || self.crv != CURVE {
            return Err(OAuthError::DpopKey(format!(
                "expected kty={KEY_TYPE} crv={CURVE}, got kty={} crv={}",
                self.kty, self.crv
            )));
        }
        Ok(())
    }

    /// Public half with `alg` forced to ES256, as embedded in proof headers
    pub fn to_public(&self) -> EcJwk {
        EcJwk {
            kty: self.kty.clone(),
            crv: self.crv.clone(),
            x: self.x.clone(),
            y: self.y.clone(),
            d: None,
            alg: Some(ALGORITHM.to_string()),
        }
    }

    /// RFC 7638 thumbprint over the required members in lexicographic order
    pub fn thumbprint(&self) -> String {
        let canonical = format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            self.crv, self.kty, self.x, self.y
        );
        sha256_base64_url(canonical.as_bytes())
    }
}

/// The per-session DPoP keypair. Passed explicitly through the exchange and
/// fetch pipelines; never shared process-wide.
#[derive(Clone)]
pub struct DpopKeyPair {
    signing_key: SigningKey,
}

impl std::fmt::Debug for DpopKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpopKeyPair").finish_non_exhaustive()
    }
}

impl DpopKeyPair {
    /// Generate a fresh keypair and check its exported JWK shape
    pub fn generate() -> Result<Self, OAuthError> {
        let keypair = Self {
            signing_key: SigningKey::random(&mut OsRng),
        };
        keypair.public_jwk()?.ensure_p256()?;
        Ok(keypair)
    }

    /// Rebuild a keypair from stored JWKs. The public JWK must belong to the
    /// private key, otherwise tokens bound to it could never be presented.
    pub fn from_jwks(private_jwk: &EcJwk, public_jwk: &EcJwk) -> Result<Self, OAuthError> {
        private_jwk.ensure_p256()?;
        public_jwk.ensure_p256()?;

        let d = private_jwk
            .d
            .as_deref()
            .ok_or_else(|| OAuthError::DpopKey("private JWK is missing `d`".to_string()))?;
        let d_bytes = base64_url_decode(d)
            .map_err(|e| OAuthError::DpopKey(format!("private JWK `d` is not base64url: {e}")))?;
        let signing_key = SigningKey::from_slice(&d_bytes)
            .map_err(|e| OAuthError::DpopKey(format!("private JWK `d` is not a P-256 scalar: {e}")))?;

        let keypair = Self { signing_key };
        let derived = keypair.public_jwk()?;
        if derived.x != public_jwk.x || derived.y != public_jwk.y {
            return Err(OAuthError::DpopKey(
                "stored public JWK does not match the private key".to_string(),
            ));
        }

        Ok(keypair)
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn public_jwk(&self) -> Result<EcJwk, OAuthError> {
        let verifying_key = VerifyingKey::from(&self.signing_key);
        let point = verifying_key.to_encoded_point(false);

        let x = point
            .x()
            .ok_or_else(|| OAuthError::DpopKey("public key has no x coordinate".to_string()))?;
        let y = point
            .y()
            .ok_or_else(|| OAuthError::DpopKey("public key has no y coordinate".to_string()))?;

        Ok(EcJwk {
            kty: KEY_TYPE.to_string(),
            crv: CURVE.to_string(),
            x: base64_url_encode(x),
            y: base64_url_encode(y),
            d: None,
            alg: Some(ALGORITHM.to_string()),
        })
    }

    pub fn private_jwk(&self) -> Result<EcJwk, OAuthError> {
        let mut jwk = self.public_jwk()?;
        jwk.d = Some(base64_url_encode(&self.signing_key.to_bytes()));
        Ok(jwk)
    }

    pub fn thumbprint(&self) -> Result<String, OAuthError> {
        Ok(self.public_jwk()?.thumbprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_is_p256() {
        let keypair = DpopKeyPair::generate().unwrap();
        let public = keypair.public_jwk().unwrap();
        assert_eq!(public.kty, "EC");
        assert_eq!(public.crv, "P-256");
        assert_eq!(public.alg.as_deref(), Some("ES256"));
        assert!(public.d.is_none());
        // 32-byte coordinates
        assert_eq!(base64_url_decode(&public.x).unwrap().len(), 32);
    }

    #[test]
    fn test_roundtrip_through_stored_jwks() {
        let keypair = DpopKeyPair::generate().unwrap();
        let private = keypair.private_jwk().unwrap();
        let public = keypair.public_jwk().unwrap();

        let restored = DpopKeyPair::from_jwks(&private, &public).unwrap();
        assert_eq!(restored.public_jwk().unwrap(), public);
    }

    #[test]
    fn test_mismatched_public_jwk_rejected() {
        let a = DpopKeyPair::generate().unwrap();
        let b = DpopKeyPair::generate().unwrap();

        let err = DpopKeyPair::from_jwks(&a.private_jwk().unwrap(), &b.public_jwk().unwrap())
            .unwrap_err();
        assert_eq!(err.code(), "DPOP_KEY_ERROR");
    }

    #[test]
    fn test_wrong_curve_rejected() {
        let mut jwk = DpopKeyPair::generate().unwrap().public_jwk().unwrap();
        jwk.crv = "P-384".to_string();
        assert!(jwk.ensure_p256().is_err());
    }

    #[test]
    fn test_thumbprint_rfc7638_example_shape() {
        // Thumbprint ignores alg/d and is stable for the same coordinates
        let keypair = DpopKeyPair::generate().unwrap();
        let public = keypair.public_jwk().unwrap();
        let private = keypair.private_jwk().unwrap();
        assert_eq!(public.thumbprint(), private.thumbprint());
        assert_eq!(public.thumbprint().len(), 43);
    }

    #[test]
    fn test_debug_hides_private_scalar() {
        let private = DpopKeyPair::generate().unwrap().private_jwk().unwrap();
        let d = private.d.clone().unwrap();
        assert!(!format!("{private:?}").contains(&d));
    }
}
