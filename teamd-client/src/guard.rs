//! Lease-gated tool interception and inbox steering lines.
//!
//! The guard vetoes file-mutating tool invocations inside a host agent
//! by asking the daemon whether the target path falls under a lease the
//! calling agent currently holds. Unknown situations always block.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use team_common::types::InboxEvent;

use crate::{ClientResult, TeamdClient};

/// Tools whose invocations mutate files and are therefore gated.
pub const GATED_TOOLS: [&str; 3] = ["write", "edit", "bash"];

#[derive(Debug, Clone, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardDecision {
    pub allow: bool,
    pub reason: String,
}

impl GuardDecision {
    fn allowed(reason: impl Into<String>) -> Self {
        Self {
            allow: true,
            reason: reason.into(),
        }
    }

    fn blocked(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: reason.into(),
        }
    }
}

/// Target path of a gated invocation: the file for write/edit, the
/// explicit path or the working directory for bash.
pub fn target_path(invocation: &ToolInvocation) -> Option<String> {
    match invocation.tool_name.as_str() {
        "write" | "edit" => invocation.tool_input["file_path"]
            .as_str()
            .map(str::to_string),
        "bash" => Some(
            invocation.tool_input["path"]
                .as_str()
                .unwrap_or(".")
                .to_string(),
        ),
        _ => None,
    }
}

/// The intercept decision for one tool invocation.
///
/// `interactive` reflects whether the host agent has a surface the
/// daemon answer can steer; without one, gated tools block outright.
pub async fn intercept(
    client: Option<&TeamdClient>,
    invocation: &ToolInvocation,
    interactive: bool,
) -> GuardDecision {
    if !GATED_TOOLS.contains(&invocation.tool_name.as_str()) {
        return GuardDecision::allowed("tool_not_gated");
    }
    if !interactive {
        return GuardDecision::blocked(
            "host agent has no interactive surface; file-mutating tools are blocked",
        );
    }
    let Some(path) = target_path(invocation) else {
        return GuardDecision::blocked(format!(
            "no target path in {} invocation",
            invocation.tool_name
        ));
    };
    let Some(client) = client else {
        return GuardDecision::blocked("missing_teamd_discovery");
    };

    let answer = client.can_write(&path).await;
    if answer.allow {
        GuardDecision::allowed(answer.reason)
    } else {
        warn!(path = %path, reason = %answer.reason, "Guard blocked tool invocation");
        GuardDecision::blocked(format!("write to '{path}' denied: {}", answer.reason))
    }
}

/// One compact steering line per inbox event. Never multi-line, never
/// the full event body.
pub fn summarize_event(event: &InboxEvent) -> String {
    let reference = event.task_id.as_deref().or(event.thread_id.as_deref());
    let line = match reference {
        Some(reference) => format!(
            "INBOX: {} {} by {}",
            event.event_type, reference, event.actor
        ),
        None => format!("INBOX: {} by {}", event.event_type, event.actor),
    };
    line.replace(['\n', '\r'], " ")
}

/// Fetch events past `since` and render them as steering lines.
pub async fn poll_inbox_once(
    client: &TeamdClient,
    since: u64,
) -> ClientResult<(Vec<String>, u64)> {
    let page = client.fetch_inbox(since).await?;
    let lines = page.events.iter().map(summarize_event).collect();
    Ok((lines, page.next_since))
}

/// Poll the daemon forever, emitting one line per new event.
pub async fn run_inbox_loop<F>(client: &TeamdClient, interval: Duration, mut emit: F)
where
    F: FnMut(String),
{
    let mut since = 0;
    loop {
        match poll_inbox_once(client, since).await {
            Ok((lines, next_since)) => {
                for line in lines {
                    emit(line);
                }
                since = next_since;
            }
            Err(err) => debug!("inbox poll failed: {err}"),
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn invocation(tool: &str, input: Value) -> ToolInvocation {
        ToolInvocation {
            tool_name: tool.to_string(),
            tool_input: input,
        }
    }

    #[test]
    fn summaries_are_one_line_without_content() {
        let event = InboxEvent {
            cursor: 7,
            event_type: "task_completed".into(),
            task_id: Some("task-001".into()),
            thread_id: None,
            actor: "worker_a".into(),
            summary: "Task task-001 completed by worker_a".into(),
            content: Some("full thread dump\nline 2".into()),
            created_at: Utc::now(),
        };
        let line = summarize_event(&event);
        assert_eq!(line, "INBOX: task_completed task-001 by worker_a");
        assert!(!line.contains('\n'));
        assert!(!line.contains("full thread dump"));
    }

    #[test]
    fn thread_events_reference_the_thread() {
        let event = InboxEvent {
            cursor: 1,
            event_type: "thread_message".into(),
            task_id: None,
            thread_id: Some("thread-0002".into()),
            actor: "worker_b".into(),
            summary: "hello".into(),
            content: None,
            created_at: Utc::now(),
        };
        assert_eq!(
            summarize_event(&event),
            "INBOX: thread_message thread-0002 by worker_b"
        );
    }

    #[test]
    fn target_paths_follow_tool_semantics() {
        assert_eq!(
            target_path(&invocation("write", json!({"file_path": "src/a.rs"}))).as_deref(),
            Some("src/a.rs")
        );
        assert_eq!(
            target_path(&invocation("edit", json!({"file_path": "b.md"}))).as_deref(),
            Some("b.md")
        );
        assert_eq!(
            target_path(&invocation("bash", json!({}))).as_deref(),
            Some(".")
        );
        assert_eq!(
            target_path(&invocation("bash", json!({"path": "scripts"}))).as_deref(),
            Some("scripts")
        );
        assert_eq!(target_path(&invocation("read", json!({}))), None);
    }

    #[tokio::test]
    async fn ungated_tools_pass_and_unknown_situations_block() {
        let decision = intercept(None, &invocation("read", json!({})), true).await;
        assert!(decision.allow);

        let decision = intercept(
            None,
            &invocation("write", json!({"file_path": "src/a.rs"})),
            true,
        )
        .await;
        assert!(!decision.allow);
        assert_eq!(decision.reason, "missing_teamd_discovery");

        let decision = intercept(None, &invocation("write", json!({})), true).await;
        assert!(!decision.allow);

        let decision = intercept(
            None,
            &invocation("bash", json!({"path": "scripts"})),
            false,
        )
        .await;
        assert!(!decision.allow);
        assert!(decision.reason.contains("no interactive surface"));
    }
}
