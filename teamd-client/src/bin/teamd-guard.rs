//! PreToolUse hook binary.
//!
//! Reads one JSON tool invocation from stdin, asks the daemon whether
//! the targeted path is covered by a lease the calling agent holds, and
//! prints the decision as JSON on stdout.

use std::io::Read;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;

use teamd_client::discovery::discover;
use teamd_client::guard::{intercept, ToolInvocation};
use teamd_client::TeamdClient;

#[derive(Debug, Deserialize)]
struct HookInput {
    tool_name: String,
    #[serde(default)]
    tool_input: serde_json::Value,
    /// Hosts without an interactive surface set this false and get an
    /// unconditional block for gated tools.
    #[serde(default = "default_interactive")]
    interactive: bool,
}

fn default_interactive() -> bool {
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_writer(std::io::stderr)
        .init();

    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("failed to read hook input")?;
    let input: HookInput =
        serde_json::from_str(&raw).context("hook input is not valid JSON")?;

    let client = discover().map(TeamdClient::new);
    let invocation = ToolInvocation {
        tool_name: input.tool_name,
        tool_input: input.tool_input,
    };
    let decision = intercept(client.as_ref(), &invocation, input.interactive).await;

    let verdict = if decision.allow { "allow" } else { "block" };
    println!("{}", json!({ "decision": verdict, "reason": decision.reason }));
    Ok(())
}
