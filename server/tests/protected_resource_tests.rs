mod common;

use common::{harness, harness_with, HarnessOptions};
use fixtures::pds::PdsConfig;
use fixtures::{FIXTURE_DID, FIXTURE_HANDLE};
use reqwest::StatusCode;

#[tokio::test]
async fn test_session_proxy_sends_dpop_bound_request() {
    let h = harness().await;
    let session_id = h.login().await;

    let (status, body) = h.get_with_session("/api/bsky/session", &session_id).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ok"], true);
    assert_eq!(body["data"]["did"], FIXTURE_DID);
    assert_eq!(body["data"]["handle"], FIXTURE_HANDLE);
    assert_eq!(h.pds.calls(), 1);
    assert_eq!(h.plc.lookups(), 1);

    let proofs = h.pds.proofs();
    assert_eq!(proofs[0]["htm"], "GET");
    assert_eq!(
        proofs[0]["htu"],
        format!("{}/xrpc/com.atproto.server.getSession", h.pds_url)
    );
    assert!(proofs[0]["ath"].is_string());
}

#[tokio::test]
async fn test_pds_nonce_challenge_retries_once() {
    let h = harness_with(HarnessOptions {
        pds: PdsConfig {
            require_nonce: Some("abc123".to_string()),
            nonce_in_www_authenticate: false,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let session_id = h.login().await;

    let (status, body) = h.get_with_session("/api/bsky/session", &session_id).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["did"], FIXTURE_DID);
    assert_eq!(h.pds.calls(), 2);

    let proofs = h.pds.proofs();
    assert!(proofs[0].get("nonce").is_none());
    assert_eq!(proofs[1]["nonce"], "abc123");
    assert_ne!(proofs[0]["jti"], proofs[1]["jti"]);
    assert_eq!(proofs[0]["ath"], proofs[1]["ath"]);
}

#[tokio::test]
async fn test_pds_nonce_from_www_authenticate() {
    let h = harness_with(HarnessOptions {
        pds: PdsConfig {
            require_nonce: Some("from-header".to_string()),
            nonce_in_www_authenticate: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let session_id = h.login().await;

    let (status, _) = h.get_with_session("/api/bsky/session", &session_id).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.pds.proofs()[1]["nonce"], "from-header");
}

#[tokio::test]
async fn test_protected_routes_require_session() {
    let h = harness().await;

    for path in ["/api/bsky/session", "/api/bsky/repo"] {
        let response = h.client.get(h.url(path)).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "AUTH_REQUIRED");
        assert_eq!(body["status"], 401);
    }

    let (status, body) = h.get_with_session("/api/bsky/session", "unknown").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "AUTH_REQUIRED");

    let (status, _) = h.post_with_session("/api/auth/refresh", "unknown").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert_eq!(h.pds.calls(), 0);
}

#[tokio::test]
async fn test_repo_defaults_to_session_did() {
    let h = harness().await;
    let session_id = h.login().await;

    let (status, body) = h.get_with_session("/api/bsky/repo", &session_id).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["did"], FIXTURE_DID);
    assert_eq!(body["data"]["handleIsCorrect"], true);

    let path = format!("/api/bsky/repo?repo={FIXTURE_HANDLE}");
    let (status, body) = h.get_with_session(&path, &session_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["handle"], FIXTURE_HANDLE);
}

#[tokio::test]
async fn test_upstream_error_is_forwarded_with_status() {
    let h = harness().await;
    let session_id = h.login().await;

    let (status, body) = h
        .get_with_session("/api/bsky/repo?repo=did:plc:someoneelse", &session_id)
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "RepoNotFound");
    assert_eq!(body["message"], "RepoNotFound");
    assert_eq!(body["status"], 400);

    // Not a nonce challenge, so no retry
    assert_eq!(h.pds.calls(), 1);
}

#[tokio::test]
async fn test_logged_out_session_cannot_reach_pds() {
    let h = harness().await;
    let session_id = h.login().await;

    let (status, _) = h.post_with_session("/api/auth/logout", &session_id).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = h.get_with_session("/api/bsky/session", &session_id).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "AUTH_REQUIRED");
    assert_eq!(h.pds.calls(), 0);
}

#[tokio::test]
async fn test_second_nonce_challenge_is_returned_not_retried() {
    let h = harness_with(HarnessOptions {
        pds: PdsConfig {
            challenge_every_request: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let session_id = h.login().await;

    let (status, body) = h.get_with_session("/api/bsky/session", &session_id).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "use_dpop_nonce");
    assert_eq!(body["status"], 401);
    assert_eq!(h.pds.calls(), 2);
    assert_eq!(h.pds.proofs()[1]["nonce"], "rotating-1");
}

#[tokio::test]
async fn test_failed_plc_lookup_falls_back_to_token_audience() {
    let h = harness_with(HarnessOptions {
        plc_without_records: true,
        ..Default::default()
    })
    .await;
    let session_id = h.login().await;

    let (status, body) = h.get_with_session("/api/bsky/session", &session_id).await;

    // The access token's `aud` is the PDS
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["did"], FIXTURE_DID);
    assert_eq!(h.plc.lookups(), 1);
    assert_eq!(h.pds.calls(), 1);
    assert_eq!(
        h.pds.proofs()[0]["htu"],
        format!("{}/xrpc/com.atproto.server.getSession", h.pds_url)
    );
}
