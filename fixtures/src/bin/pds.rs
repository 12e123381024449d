use clap::Parser;
use fixtures::pds::{router, PdsConfig, PdsState};
use fixtures::{run_server, FixtureArgs};

/// PDS (Personal Data Server) fixture server
#[derive(Parser, Debug)]
#[clap(name = "pds-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,

    /// Require this DPoP nonce on XRPC calls
    #[arg(long)]
    require_nonce: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let config = PdsConfig {
        require_nonce: args.require_nonce,
        ..Default::default()
    };

    run_server(args.common, router(PdsState::new(config))).await
}
