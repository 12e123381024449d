use clap::Parser;
use fixtures::plc::{router, PlcState};
use fixtures::{require_env_var, run_server, FixtureArgs};

/// PLC Directory fixture server
#[derive(Parser, Debug)]
#[clap(name = "plc-directory-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    // Get URL of the PDS fixture
    let pds_url = require_env_var("PDS_URL", args.common.force)?;

    run_server(args.common, router(PlcState::new(pds_url))).await
}
