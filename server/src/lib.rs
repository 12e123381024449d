//! langbird: OAuth 2.0 + PKCE + DPoP gateway between the language-learning
//! clients and a user's AT Protocol PDS.

pub mod auth;
pub mod did;
pub mod encryption;
pub mod errors;
pub mod oauth;
pub mod pds;
pub mod routes;
pub mod setup;
pub mod state;
pub mod store;

pub use errors::OAuthError;
pub use state::{AppState, OAuthConfig};
