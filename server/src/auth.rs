use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use tracing::debug;

use crate::errors::OAuthError;
use crate::oauth::session::{Session, SessionStore};
use crate::state::AppState;

/// `Authorization: Bearer <sessionId>`
pub fn bearer_session_id(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim().to_string()).filter(|t| !t.is_empty())
}

async fn lookup(parts: &Parts, state: &AppState) -> Result<Option<Session>, OAuthError> {
    let Some(session_id) = bearer_session_id(parts) else {
        debug!("No bearer session id on request");
        return Ok(None);
    };

    let session = SessionStore::new(state.storage.clone())
        .get(&session_id)
        .await?;
    if session.is_none() {
        debug!(session_id = %session_id, "Session is invalid or expired");
    }
    Ok(session)
}

/// A valid session, or `401 AUTH_REQUIRED`
#[derive(Debug, Clone)]
pub struct AuthSession(pub Session);

#[async_trait]
impl FromRequestParts<AppState> for AuthSession {
    type Rejection = OAuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        lookup(parts, state)
            .await?
            .map(AuthSession)
            .ok_or(OAuthError::AuthRequired)
    }
}

/// The session if there is a valid one. Lookup failures count as "no
/// session" so identity checks never error.
#[derive(Debug, Clone)]
pub struct OptionalSession {
    pub session: Option<Session>,
    pub session_id: Option<String>,
}

#[async_trait]
impl FromRequestParts<AppState> for OptionalSession {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let session = match lookup(parts, state).await {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(error = %err, "Session lookup failed, treating as signed out");
                None
            }
        };

        Ok(OptionalSession {
            session,
            session_id: bearer_session_id(parts),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(header: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/api/auth/me");
        if let Some(value) = header {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_bearer_session_id() {
        assert_eq!(
            bearer_session_id(&parts(Some("Bearer abc-123"))).as_deref(),
            Some("abc-123")
        );
        assert_eq!(
            bearer_session_id(&parts(Some("bearer abc-123"))).as_deref(),
            Some("abc-123")
        );
        assert_eq!(bearer_session_id(&parts(Some("DPoP abc-123"))), None);
        assert_eq!(bearer_session_id(&parts(Some("Bearer "))), None);
        assert_eq!(bearer_session_id(&parts(None)), None);
    }
}
