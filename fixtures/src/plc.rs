//! Mock PLC directory resolving every `did:plc:` to one PDS.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;

use crate::FIXTURE_HANDLE;

#[derive(Clone)]
pub struct PlcState {
    pds_url: Arc<String>,
    lookups: Arc<AtomicUsize>,
    /// When false every DID is unknown
    registered: bool,
}

impl PlcState {
    pub fn new(pds_url: impl Into<String>) -> Self {
        Self {
            pds_url: Arc::new(pds_url.into()),
            lookups: Arc::default(),
            registered: true,
        }
    }

    /// A directory that knows no DIDs, for exercising lookup failures
    pub fn without_records(self) -> Self {
        Self {
            registered: false,
            ..self
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

pub fn router(state: PlcState) -> Router {
    Router::new()
        .route("/", get(|| async { "PLC Directory Fixture Server" }))
        .route("/:did", get(resolve_did))
        .with_state(state)
}

pub async fn spawn(pds_url: &str) -> anyhow::Result<(String, PlcState)> {
    spawn_state(PlcState::new(pds_url)).await
}

pub async fn spawn_state(state: PlcState) -> anyhow::Result<(String, PlcState)> {
    let url = crate::spawn(router(state.clone())).await?;
    Ok((url, state))
}

async fn resolve_did(State(state): State<PlcState>, Path(did): Path<String>) -> Response {
    state.lookups.fetch_add(1, Ordering::SeqCst);

    if !state.registered || !did.starts_with("did:plc:") {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": format!("DID not registered: {did}") })),
        )
            .into_response();
    }

    Json(json!({
        "@context": ["https://www.w3.org/ns/did/v1"],
        "id": did,
        "alsoKnownAs": [format!("at://{FIXTURE_HANDLE}")],
        "verificationMethod": [],
        "service": [
            {
                "id": "#atproto_pds",
                "type": "AtprotoPersonalDataServer",
                "serviceEndpoint": state.pds_url.as_str(),
            }
        ]
    }))
    .into_response()
}
