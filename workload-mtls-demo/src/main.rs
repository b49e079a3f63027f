use anyhow::Result;
use clap::Parser;

use workload_mtls_demo::cli::{Cli, Command};
use workload_mtls_demo::{client, server, shutdown_on_ctrl_c, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::setup_tracing(&cli.log_level, cli.log_format)?;

    let shutdown = shutdown_on_ctrl_c();
    let initial_fetch_timeout = cli.initial_fetch_timeout();

    match &cli.command {
        Command::Server(args) => server::run(args, initial_fetch_timeout, shutdown).await,
        Command::Client(args) => client::run(args, initial_fetch_timeout, shutdown).await,
    }
}
