use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use color_eyre::eyre::WrapErr;
use langbird::{
    routes,
    setup::{setup_sentry, setup_tracing},
    state::{AppState, OAuthConfig},
    store::{run_sweeper, MemoryKvStore},
};
use sentry_tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;
use tracing::info;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    // Initialize Sentry for error tracking
    let _sentry_guard = setup_sentry();

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()?
        .block_on(async { run_application().await })
}

async fn run_application() -> color_eyre::Result<()> {
    setup_tracing("langbird")?;

    // Configuration errors abort here, before anything listens
    let config = OAuthConfig::from_env()?;
    info!(
        issuer = %config.issuer,
        token_endpoint = %config.token_endpoint,
        dev_redirect = config.dev_target.is_some(),
        development_mode = config.development_mode,
        "Loaded OAuth configuration"
    );

    let (app_state, kv) = AppState::from_env(config)?;

    info!("Spawning application tasks");
    let futures = spawn_application_tasks(app_state, kv)?;

    futures::future::try_join_all(futures).await?;

    Ok(())
}

/// Spawn all application background tasks
fn spawn_application_tasks(
    app_state: AppState,
    kv: Arc<MemoryKvStore>,
) -> color_eyre::Result<Vec<tokio::task::JoinHandle<color_eyre::Result<()>>>> {
    let mut futures = vec![];

    if is_feature_enabled("SERVER") {
        info!("Server Enabled");
        futures.push(tokio::spawn(run_server(routes::routes(app_state))));
    } else {
        info!("Server Disabled");
    }

    // Expired PKCE records and sessions are purged on this schedule
    if is_feature_enabled("CRON") {
        info!("Cron Enabled");
        futures.push(tokio::spawn(run_sweeper(kv, SWEEP_INTERVAL)));
    } else {
        info!("Cron Disabled");
    }

    info!("All application tasks spawned successfully");
    Ok(futures)
}

async fn run_server(router: axum::Router) -> color_eyre::Result<()> {
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .wrap_err("PORT must be a number")?;
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .wrap_err_with(|| format!("Invalid listen address {host}:{port}"))?;

    let router = router.layer(
        ServiceBuilder::new()
            .layer(NewSentryLayer::<Request>::new_from_top())
            .layer(SentryHttpLayer::with_transaction()),
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "Listening");

    axum::serve(listener, router)
        .await
        .wrap_err("Server exited with an error")?;

    Ok(())
}

/// Check if a feature is enabled based on environment variables
fn is_feature_enabled(feature: &str) -> bool {
    std::env::var(format!("{}_DISABLED", feature)).unwrap_or_else(|_| "false".to_string()) != "true"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_is_feature_enabled_when_env_var_not_set() {
        env::remove_var("TEST_FEATURE_UNSET_DISABLED");
        assert!(is_feature_enabled("TEST_FEATURE_UNSET"));
    }

    #[test]
    fn test_is_feature_enabled_when_env_var_is_false() {
        env::set_var("TEST_FEATURE_FALSE_DISABLED", "false");
        assert!(is_feature_enabled("TEST_FEATURE_FALSE"));
        env::remove_var("TEST_FEATURE_FALSE_DISABLED");
    }

    #[test]
    fn test_is_feature_disabled_when_env_var_is_true() {
        env::set_var("TEST_FEATURE_TRUE_DISABLED", "true");
        assert!(!is_feature_enabled("TEST_FEATURE_TRUE"));
        env::remove_var("TEST_FEATURE_TRUE_DISABLED");
    }

    #[test]
    fn test_is_feature_enabled_with_other_values() {
        env::set_var("TEST_FEATURE_OTHER_DISABLED", "yes");
        assert!(is_feature_enabled("TEST_FEATURE_OTHER"));
        env::remove_var("TEST_FEATURE_OTHER_DISABLED");
    }
}
