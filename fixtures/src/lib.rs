use axum::Router;
use clap::Parser;
use std::env;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub mod auth_server;
pub mod dpop;
pub mod pds;
pub mod plc;

pub const FIXTURE_DID: &str = "did:plc:fixtureuser";
pub const FIXTURE_HANDLE: &str = "fixture-user.test";

/// Common CLI arguments for all fixture servers
#[derive(Parser, Debug, Clone)]
pub struct FixtureArgs {
    /// The port to listen on
    #[arg(short, long, default_value = "0")]
    pub port: u16,

    /// The host to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Force allow running without required environment variables (for development)
    #[arg(long)]
    pub force: bool,
}

/// Helper to get a required environment variable or return an error
pub fn require_env_var(name: &str, force: bool) -> anyhow::Result<String> {
    match env::var(name) {
        Ok(value) => Ok(value),
        Err(_) => {
            if force {
                error!("WARNING: Required environment variable {} not set. Using placeholder value because --force was specified.", name);
                Ok("http://localhost:3000".to_string())
            } else {
                anyhow::bail!(
                    "Required environment variable {} not set. Use --force to bypass this check.",
                    name
                )
            }
        }
    }
}

/// Common function to run a fixture server
pub async fn run_server(args: FixtureArgs, app: Router) -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let addr = format!("{}:{}", args.host, args.port).parse::<SocketAddr>()?;

    let app = app.layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Fixture server listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Serve `app` on an ephemeral localhost port in the background and return
/// its base URL
pub async fn spawn(app: Router) -> anyhow::Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app.layer(TraceLayer::new_for_http())).await {
            error!("Fixture server on {} stopped: {}", addr, e);
        }
    });

    Ok(format!("http://{addr}"))
}

/// Base URL a request was addressed to, from its Host header
pub(crate) fn request_base(headers: &axum::http::HeaderMap) -> String {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}
