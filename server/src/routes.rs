use axum::{
    routing::{get, post},
    Json,
};
use serde_json::{json, Value};

use crate::state::AppState;

pub mod atprotocol;
pub mod auth;
pub mod bsky;
pub mod client_metadata;
pub mod dev;

/// Build the application router with all routes
pub fn routes(app_state: AppState) -> axum::Router {
    let development_mode = app_state.config.development_mode;

    let router = axum::Router::new()
        .route("/health", get(health))
        .route("/oauth/client-metadata.json", get(client_metadata::client_metadata))
        // Authorization flow
        .route(
            "/api/atprotocol/init",
            get(atprotocol::init).post(atprotocol::init),
        )
        .route("/api/atprotocol/token", post(atprotocol::token))
        // Session management
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/refresh", post(auth::refresh))
        // DPoP-bound PDS calls
        .route("/api/bsky/session", get(bsky::session))
        .route("/api/bsky/repo", get(bsky::repo));

    let router = if development_mode {
        router.route("/dev/callback", get(dev::callback))
    } else {
        router
    };

    router
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}
