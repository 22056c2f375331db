//! teamd binary entry point.

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use teamd::bootstrap::{start, DaemonOptions};

#[derive(Parser, Debug)]
#[command(name = "teamd", version)]
#[command(about = "Coordination daemon for cooperating agents on one host")]
struct Cli {
    /// Workspace root holding one directory per team
    #[arg(long, env = "TEAM_WORKSPACE_ROOT", default_value = ".teams")]
    root: PathBuf,

    /// Team this daemon serves
    #[arg(long, env = "TEAM_ID", default_value = "default")]
    team: String,

    /// Loopback port to bind (0 picks an ephemeral port)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Bearer credential; a 256-bit one is minted when omitted
    #[arg(long, env = "TEAMD_TOKEN")]
    token: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let mut handle = start(DaemonOptions {
        root: cli.root,
        team_id: cli.team.clone(),
        port: cli.port,
        token: cli.token,
    })
    .await?;

    info!(team = %cli.team, url = %handle.url(), "teamd ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    handle.close().await;
    Ok(())
}
