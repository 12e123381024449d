use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Every failure the OAuth/DPoP pipeline can surface to a caller.
///
/// Each variant has a stable `code()` which is what clients switch on; the
/// message is for humans and may change.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("{0}")]
    Validation(String),

    #[error("Authorization state not found or expired. Restart the sign-in flow.")]
    StateExpired,

    #[error("DPoP key error: {0}")]
    DpopKey(String),

    #[error("Network error talking to {target}: {message}")]
    Network { target: String, message: String },

    /// Non-OK response from the authorization server, forwarded verbatim.
    #[error("{message}")]
    Provider {
        error: String,
        message: String,
        status: u16,
    },

    #[error("DPoP nonce retry failed: {0}")]
    NonceRetryFailed(String),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Token response is missing the required scope `{required}`")]
    MissingScope { required: String, scope: String },

    #[error("Invalid token response: {0}")]
    InvalidTokenResponse(String),

    #[error("Storage error: {0}")]
    Storage(#[from] color_eyre::Report),
}

impl OAuthError {
    pub fn code(&self) -> &str {
        match self {
            OAuthError::Validation(_) => "VALIDATION_ERROR",
            OAuthError::StateExpired => "STATE_EXPIRED",
            OAuthError::DpopKey(_) => "DPOP_KEY_ERROR",
            OAuthError::Network { .. } => "TOKEN_EXCHANGE_NETWORK",
            OAuthError::Provider { error, .. } => error.as_str(),
            OAuthError::NonceRetryFailed(_) => "DPOP_NONCE_RETRY_FAILED",
            OAuthError::AuthRequired => "AUTH_REQUIRED",
            OAuthError::MissingScope { .. } => "MISSING_REQUIRED_SCOPE",
            OAuthError::InvalidTokenResponse(_) => "INVALID_TOKEN_RESPONSE",
            OAuthError::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            OAuthError::Validation(_)
            | OAuthError::StateExpired
            | OAuthError::NonceRetryFailed(_)
            | OAuthError::MissingScope { .. } => StatusCode::BAD_REQUEST,
            OAuthError::AuthRequired => StatusCode::UNAUTHORIZED,
            OAuthError::Network { .. } | OAuthError::InvalidTokenResponse(_) => {
                StatusCode::BAD_GATEWAY
            }
            OAuthError::Provider { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            OAuthError::DpopKey(_) | OAuthError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        OAuthError::Validation(message.into())
    }

    pub(crate) fn network(target: &str, err: &reqwest::Error) -> Self {
        OAuthError::Network {
            target: target.to_string(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = ?self, code = self.code(), "Request Error");
        } else {
            tracing::warn!(error = %self, code = self.code(), "Request rejected");
        }

        let mut body = json!({
            "error": self.code(),
            "message": self.to_string(),
            "status": status.as_u16(),
        });
        if let OAuthError::MissingScope { scope, .. } = &self {
            body["scope"] = scope.clone().into();
        }

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, OAuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_keep_upstream_code_and_status() {
        let err = OAuthError::Provider {
            error: "invalid_grant".to_string(),
            message: "code already used".to_string(),
            status: 400,
        };
        assert_eq!(err.code(), "invalid_grant");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "code already used");
    }

    #[test]
    fn provider_status_outside_error_range_maps_to_bad_gateway() {
        let err = OAuthError::Provider {
            error: "TOKEN_EXCHANGE_FAILED".to_string(),
            message: "weird".to_string(),
            status: 42,
        };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn taxonomy_statuses() {
        assert_eq!(OAuthError::StateExpired.status(), StatusCode::BAD_REQUEST);
        assert_eq!(OAuthError::AuthRequired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            OAuthError::DpopKey("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            OAuthError::Network {
                target: "x".into(),
                message: "y".into()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            OAuthError::NonceRetryFailed("sign".into()).code(),
            "DPOP_NONCE_RETRY_FAILED"
        );
    }
}
