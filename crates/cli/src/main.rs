//! `team`: read-only administrative wrapper around a running teamd.
//!
//! Everything here goes through the daemon's HTTP API or the published
//! runtime descriptor; the CLI never writes workspace files.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use teamd_client::discovery::{discover, Discovery};
use teamd_client::TeamdClient;

#[derive(Parser, Debug)]
#[command(name = "team", version)]
#[command(about = "Read-only views over a teamd workspace")]
struct Cli {
    /// Emit JSON instead of plain text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect the running daemon
    #[command(subcommand)]
    Daemon(DaemonCommand),
    /// Agent environment helpers
    #[command(subcommand)]
    Agent(AgentCommand),
    /// Task views
    #[command(subcommand)]
    Tasks(TasksCommand),
}

#[derive(Subcommand, Debug)]
enum DaemonCommand {
    /// Report whether the discovered daemon answers /healthz
    Status,
}

#[derive(Subcommand, Debug)]
enum AgentCommand {
    /// Print the environment a guard client needs
    Env,
}

#[derive(Subcommand, Debug)]
enum TasksCommand {
    /// List every task of the discovered team
    List,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version are successes; anything else is not.
            let failed = err.use_stderr();
            let _ = err.print();
            return if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("team: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> Result<()> {
    let discovery = discover().context(
        "no teamd discovery: set TEAMD_URL and TEAMD_TOKEN, or point \
         TEAM_WORKSPACE_ROOT at a workspace with a runtime descriptor",
    )?;

    match cli.command {
        Command::Daemon(DaemonCommand::Status) => daemon_status(&discovery, cli.json).await,
        Command::Agent(AgentCommand::Env) => agent_env(&discovery, cli.json),
        Command::Tasks(TasksCommand::List) => tasks_list(discovery, cli.json).await,
    }
}

async fn daemon_status(discovery: &Discovery, as_json: bool) -> Result<()> {
    let response = reqwest::get(format!("{}/healthz", discovery.url.trim_end_matches('/')))
        .await
        .with_context(|| format!("daemon at {} did not answer", discovery.url))?;
    let body: serde_json::Value = response.json().await.context("malformed health response")?;
    let version = body["version"].as_str().unwrap_or("unknown");

    if as_json {
        println!(
            "{}",
            json!({
                "url": discovery.url,
                "teamId": discovery.team_id,
                "status": body["status"],
                "version": version,
            })
        );
    } else {
        println!(
            "teamd {} serving team '{}' at {}",
            version, discovery.team_id, discovery.url
        );
    }
    Ok(())
}

fn agent_env(discovery: &Discovery, as_json: bool) -> Result<()> {
    if as_json {
        println!(
            "{}",
            json!({
                "TEAMD_URL": discovery.url,
                "TEAMD_TOKEN": discovery.token,
                "TEAM_ID": discovery.team_id,
                "AGENT_ID": discovery.agent_id,
            })
        );
    } else {
        println!("export TEAMD_URL={}", discovery.url);
        println!("export TEAMD_TOKEN={}", discovery.token);
        println!("export TEAM_ID={}", discovery.team_id);
        println!("export AGENT_ID={}", discovery.agent_id);
    }
    Ok(())
}

async fn tasks_list(discovery: Discovery, as_json: bool) -> Result<()> {
    let client = TeamdClient::new(discovery);
    let tasks = client.list_tasks().await.context("task listing failed")?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("no tasks");
        return Ok(());
    }
    for task in tasks {
        let status = serde_json::to_value(task.status)?;
        println!(
            "{}  {:<12} {:<12} {}",
            task.task_id,
            status.as_str().unwrap_or("unknown"),
            task.owner.as_deref().unwrap_or("-"),
            task.title
        );
    }
    Ok(())
}
