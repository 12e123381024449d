#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use fixtures::auth_server::{self, AuthServerConfig, AuthServerState};
use fixtures::pds::{self, PdsConfig, PdsState};
use fixtures::plc::{self, PlcState};
use langbird::store::{MemoryKvStore, Storage};
use langbird::{AppState, OAuthConfig};
use serde_json::Value;

pub const REDIRECT_URI: &str = "http://127.0.0.1/callback";
pub const CLIENT_ID: &str = "http://localhost/oauth/client-metadata.json";

/// The service under test plus every upstream it talks to
pub struct Harness {
    pub app_url: String,
    pub auth_url: String,
    pub auth: AuthServerState,
    pub pds_url: String,
    pub pds: PdsState,
    pub plc: PlcState,
    pub kv: Arc<MemoryKvStore>,
    pub client: reqwest::Client,
}

pub struct HarnessOptions {
    pub auth: AuthServerConfig,
    pub pds: PdsConfig,
    /// PLC directory answers 404 for every DID
    pub plc_without_records: bool,
    pub env: Vec<(&'static str, String)>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            auth: AuthServerConfig::default(),
            pds: PdsConfig::default(),
            plc_without_records: false,
            env: vec![],
        }
    }
}

pub async fn harness() -> Harness {
    harness_with(HarnessOptions::default()).await
}

pub async fn harness_with(options: HarnessOptions) -> Harness {
    let (pds_url, pds) = pds::spawn(options.pds).await.unwrap();
    let plc_state = PlcState::new(pds_url.clone());
    let plc_state = if options.plc_without_records {
        plc_state.without_records()
    } else {
        plc_state
    };
    let (plc_url, plc) = plc::spawn_state(plc_state).await.unwrap();

    let mut auth_config = options.auth;
    if auth_config.pds_url.is_none() {
        auth_config.pds_url = Some(pds_url.clone());
    }
    let (auth_url, auth) = auth_server::spawn(auth_config).await.unwrap();

    let mut vars: HashMap<&str, String> = HashMap::from([
        ("OAUTH_ISSUER", auth_url.clone()),
        ("OAUTH_CLIENT_ID", CLIENT_ID.to_string()),
        ("OAUTH_REDIRECT_URI", REDIRECT_URI.to_string()),
        ("PLC_DIRECTORY_URL", plc_url),
        ("HTTP_TIMEOUT_SECS", "5".to_string()),
    ]);
    vars.extend(options.env);

    let config = OAuthConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();
    let kv = Arc::new(MemoryKvStore::default());
    let storage = Storage::new(kv.clone(), None);
    let app_state = AppState::new(config, storage).unwrap();

    let app_url = fixtures::spawn(langbird::routes::routes(app_state))
        .await
        .unwrap();

    Harness {
        app_url,
        auth_url,
        auth,
        pds_url,
        pds,
        plc,
        kv,
        client: reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap(),
    }
}

impl Harness {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.app_url)
    }

    pub async fn init(&self) -> Value {
        self.client
            .get(self.url("/api/atprotocol/init"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Follow an authorize URL on the fixture and return the redirect's
    /// `code` and `state`
    pub async fn authorize(&self, authorize_url: &str) -> (String, String) {
        let response = self.client.get(authorize_url).send().await.unwrap();
        assert!(response.status().is_redirection(), "{}", response.status());

        let location = response.headers()["location"].to_str().unwrap().to_string();
        let location = reqwest::Url::parse(&location).unwrap();
        let params: HashMap<String, String> = location.query_pairs().into_owned().collect();
        (params["code"].clone(), params["state"].clone())
    }

    pub async fn exchange(&self, body: Value) -> (reqwest::StatusCode, Value) {
        let response = self
            .client
            .post(self.url("/api/atprotocol/token"))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    /// init → authorize → token, returning the new session id
    pub async fn login(&self) -> String {
        let init = self.init().await;
        let (code, state) = self
            .authorize(init["authorize_url"].as_str().unwrap())
            .await;
        let (status, body) = self
            .exchange(serde_json::json!({ "code": code, "state": state }))
            .await;
        assert_eq!(status, reqwest::StatusCode::OK, "{body}");
        body["sessionId"].as_str().unwrap().to_string()
    }

    pub async fn get_with_session(&self, path: &str, session_id: &str) -> (reqwest::StatusCode, Value) {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(session_id)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    pub async fn post_with_session(&self, path: &str, session_id: &str) -> (reqwest::StatusCode, Value) {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(session_id)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }
}
