use clap::Parser;
use fixtures::auth_server::{router, AuthServerConfig, AuthServerState};
use fixtures::{run_server, FixtureArgs};

/// OAuth authorization server fixture
#[derive(Parser, Debug)]
#[clap(name = "auth-server-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,

    /// Require this DPoP nonce on the token endpoint
    #[arg(long)]
    require_nonce: Option<String>,

    /// Scope string returned in token responses
    #[arg(long, default_value = "atproto transition:generic")]
    scope: String,

    /// Token lifetime in seconds
    #[arg(long, default_value = "3600")]
    expires_in: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let config = AuthServerConfig {
        require_nonce: args.require_nonce,
        scope: args.scope,
        expires_in: args.expires_in,
        pds_url: std::env::var("PDS_URL").ok(),
        ..Default::default()
    };

    run_server(args.common, router(AuthServerState::new(config))).await
}
