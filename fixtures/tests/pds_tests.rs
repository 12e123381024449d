use fixtures::{auth_server, pds, plc, FIXTURE_DID};
use serde_json::Value;

fn no_redirect_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_pds_rejects_missing_authorization() {
    let (url, state) = pds::spawn(pds::PdsConfig::default()).await.unwrap();

    let response = reqwest::get(format!("{url}/xrpc/com.atproto.server.getSession"))
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["error"], "AuthMissing");
    assert_eq!(state.calls(), 1);
}

#[tokio::test]
async fn test_pds_rejects_bearer_without_proof() {
    let (url, _state) = pds::spawn(pds::PdsConfig::default()).await.unwrap();

    let response = reqwest::Client::new()
        .get(format!("{url}/xrpc/com.atproto.server.getSession"))
        .header("Authorization", "DPoP some-token")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["error"], "invalid_dpop_proof");
}

#[tokio::test]
async fn test_plc_directory_points_at_pds() {
    let (url, state) = plc::spawn("http://pds.test").await.unwrap();

    let json: Value = reqwest::get(format!("{url}/{FIXTURE_DID}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(json["id"], FIXTURE_DID);
    assert_eq!(json["service"][0]["type"], "AtprotoPersonalDataServer");
    assert_eq!(json["service"][0]["serviceEndpoint"], "http://pds.test");

    let response = reqwest::get(format!("{url}/did:web:example.com")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(state.lookups(), 2);
}

#[tokio::test]
async fn test_authorize_redirects_back_with_code_and_state() {
    let (url, _state) = auth_server::spawn(auth_server::AuthServerConfig::default())
        .await
        .unwrap();

    let response = no_redirect_client()
        .get(format!("{url}/oauth/authorize"))
        .query(&[
            ("client_id", "http://localhost"),
            ("redirect_uri", "http://app.test/callback"),
            ("response_type", "code"),
            ("state", "state-123"),
            ("code_challenge", "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"),
            ("code_challenge_method", "S256"),
        ])
        .send()
        .await
        .unwrap();

    assert!(response.status().is_redirection());
    let location = response.headers()["location"].to_str().unwrap();
    let location = reqwest::Url::parse(location).unwrap();
    let params: std::collections::HashMap<_, _> = location.query_pairs().into_owned().collect();

    assert_eq!(location.path(), "/callback");
    assert_eq!(params["state"], "state-123");
    assert!(params["code"].starts_with("code-"));
}

#[tokio::test]
async fn test_authorize_requires_s256_challenge() {
    let (url, _state) = auth_server::spawn(auth_server::AuthServerConfig::default())
        .await
        .unwrap();

    let response = no_redirect_client()
        .get(format!("{url}/oauth/authorize"))
        .query(&[("redirect_uri", "http://app.test/callback"), ("state", "s")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_token_endpoint_requires_dpop() {
    let (url, state) = auth_server::spawn(auth_server::AuthServerConfig::default())
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .post(format!("{url}/oauth/token"))
        .form(&[("grant_type", "authorization_code"), ("code", "abc")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["error"], "invalid_dpop_proof");
    assert_eq!(state.token_calls(), 1);
}
