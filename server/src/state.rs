use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{eyre, WrapErr};
use reqwest::Url;

use crate::encryption::EncryptionConfig;
use crate::store::{MemoryKvStore, Storage};

/// Scope token every accepted access token must carry.
pub const REQUIRED_SCOPE: &str = "atproto";

pub const DEFAULT_ISSUER: &str = "https://bsky.social";
pub const DEFAULT_SCOPE: &str = "atproto transition:generic";
pub const DEFAULT_PLC_DIRECTORY_URL: &str = "https://plc.directory";

/// A client id / redirect URI pair registered with the authorization server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub client_id: String,
    pub redirect_uri: String,
}

/// OAuth settings, validated once at startup and immutable afterwards.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub issuer: String,
    pub authorize_endpoint: String,
    pub token_endpoint: String,
    pub scope: String,
    pub default_target: RedirectTarget,
    pub dev_target: Option<RedirectTarget>,
    pub plc_directory_url: String,
    pub http_timeout: Duration,
    pub production: bool,
    pub development_mode: bool,
}

impl OAuthConfig {
    pub fn from_env() -> color_eyre::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> color_eyre::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let production = var("APP_ENV").is_some_and(|v| v.eq_ignore_ascii_case("production"));
        let development_mode = var("DEVELOPMENT_MODE").is_some_and(|v| v == "1");

        let issuer = var("OAUTH_ISSUER")
            .unwrap_or_else(|| DEFAULT_ISSUER.to_string())
            .trim_end_matches('/')
            .to_string();

        let token_endpoint = match var("OAUTH_TOKEN_ENDPOINT") {
            Some(endpoint) => endpoint,
            None if production => {
                return Err(eyre!(
                    "OAUTH_TOKEN_ENDPOINT must be set when APP_ENV=production"
                ))
            }
            None => format!("{issuer}/oauth/token"),
        };

        let authorize_endpoint =
            var("OAUTH_AUTHORIZE_ENDPOINT").unwrap_or_else(|| format!("{issuer}/oauth/authorize"));

        let default_target = RedirectTarget {
            client_id: var("OAUTH_CLIENT_ID")
                .ok_or_else(|| eyre!("OAUTH_CLIENT_ID environment variable not set"))?,
            redirect_uri: var("OAUTH_REDIRECT_URI")
                .ok_or_else(|| eyre!("OAUTH_REDIRECT_URI environment variable not set"))?,
        };

        let dev_target = match (var("OAUTH_DEV_CLIENT_ID"), var("OAUTH_DEV_REDIRECT_URI")) {
            (Some(client_id), Some(redirect_uri)) => Some(RedirectTarget {
                client_id,
                redirect_uri,
            }),
            (None, None) => None,
            _ => {
                tracing::warn!(
                    "Only one of OAUTH_DEV_CLIENT_ID / OAUTH_DEV_REDIRECT_URI is set, ignoring the dev redirect"
                );
                None
            }
        };

        let http_timeout = match var("HTTP_TIMEOUT_SECS") {
            Some(secs) => Duration::from_secs(
                secs.parse()
                    .wrap_err_with(|| format!("HTTP_TIMEOUT_SECS is not a number: {secs}"))?,
            ),
            None => Duration::from_secs(10),
        };

        let config = Self {
            issuer,
            authorize_endpoint,
            token_endpoint,
            scope: var("OAUTH_SCOPE").unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
            default_target,
            dev_target,
            plc_directory_url: var("PLC_DIRECTORY_URL")
                .unwrap_or_else(|| DEFAULT_PLC_DIRECTORY_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            http_timeout,
            production,
            development_mode,
        };

        config.validate()?;

        Ok(config)
    }

    /// Check every URL and invariant before the server accepts traffic
    pub fn validate(&self) -> color_eyre::Result<()> {
        parse_http_url("OAUTH_ISSUER", &self.issuer)?;
        parse_http_url("OAUTH_AUTHORIZE_ENDPOINT", &self.authorize_endpoint)?;
        parse_http_url("OAUTH_TOKEN_ENDPOINT", &self.token_endpoint)?;
        parse_http_url("PLC_DIRECTORY_URL", &self.plc_directory_url)?;
        parse_http_url("OAUTH_REDIRECT_URI", &self.default_target.redirect_uri)?;
        if let Some(dev) = &self.dev_target {
            parse_http_url("OAUTH_DEV_REDIRECT_URI", &dev.redirect_uri)?;
        }

        if !self.scope.split_whitespace().any(|s| s == REQUIRED_SCOPE) {
            return Err(eyre!(
                "OAUTH_SCOPE must include `{REQUIRED_SCOPE}`, got `{}`",
                self.scope
            ));
        }

        if self.http_timeout.is_zero() {
            return Err(eyre!("HTTP_TIMEOUT_SECS must be greater than zero"));
        }

        Ok(())
    }

    /// Pick the redirect pair for an authorize request. The dev pair only
    /// applies when it was configured.
    pub fn redirect_target(&self, use_dev_redirect: bool) -> &RedirectTarget {
        match (&self.dev_target, use_dev_redirect) {
            (Some(dev), true) => dev,
            _ => &self.default_target,
        }
    }
}

fn parse_http_url(name: &str, value: &str) -> color_eyre::Result<Url> {
    let url = Url::parse(value).wrap_err_with(|| format!("{name} is not a valid URL: {value}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(eyre!("{name} must be an http(s) URL, got scheme `{other}`")),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<OAuthConfig>,
    pub http: reqwest::Client,
    pub storage: Storage,
}

impl AppState {
    /// In-memory KV store, optionally encrypted with `ENCRYPTION_KEY`. The
    /// store is handed back as well so the sweeper can purge it.
    pub fn from_env(config: OAuthConfig) -> color_eyre::Result<(Self, Arc<MemoryKvStore>)> {
        let encryption = EncryptionConfig::from_env()?;
        if encryption.is_none() {
            tracing::warn!("ENCRYPTION_KEY not set, session store values are kept unencrypted");
        }

        let kv = Arc::new(MemoryKvStore::default());
        let storage = Storage::new(kv.clone(), encryption);
        Ok((Self::new(config, storage)?, kv))
    }

    pub fn new(config: OAuthConfig, storage: Storage) -> color_eyre::Result<Self> {
        let http = reqwest::ClientBuilder::new()
            .timeout(config.http_timeout)
            .use_rustls_tls()
            .user_agent(concat!("langbird/", env!("CARGO_PKG_VERSION")))
            .build()
            .wrap_err("Failed to build HTTP client")?;

        Ok(Self {
            config: Arc::new(config),
            http,
            storage,
        })
    }
}
