//! OAuth 2.0 authorization code flow with PKCE and DPoP-bound tokens.
//! This includes PKCE records, DPoP keys and proofs, token exchange and sessions.

pub mod dpop;
pub mod jwk;
pub mod pkce;
pub mod session;
pub mod token;
pub mod utils;

pub use jwk::{DpopKeyPair, EcJwk};
pub use session::{Session, SessionStore};
pub use token::{ExchangeRequest, TokenResponse};
