//! Per-agent inbox fan-out.
//!
//! Inboxes are caches: rebuildable from the audit trail, never
//! authority. Cursors are strictly increasing per agent and never
//! reused, so clients can poll with a `since` watermark.

use std::fs;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use team_common::error::{StoreError, StoreResult};
use team_common::fs::write_json_atomic;
use team_common::types::{Inbox, InboxEvent, Thread, ThreadMessage};
use team_common::valid_ident;

use super::Store;

/// Cap on the stored `summary` line; full bodies ride in `content`.
const SUMMARY_LIMIT: usize = 120;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxPage {
    pub events: Vec<InboxEvent>,
    pub next_since: u64,
}

impl Store {
    fn read_inbox(&self, agent_id: &str) -> StoreResult<Inbox> {
        let bytes = match fs::read(self.inbox_path(agent_id)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Inbox::empty(agent_id))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn deliver(&self, agent_id: &str, mut event: InboxEvent) -> StoreResult<()> {
        let mut inbox = self.read_inbox(agent_id)?;
        event.cursor = inbox.next_cursor;
        inbox.next_cursor += 1;
        inbox.events.push(event);
        write_json_atomic(&self.inbox_path(agent_id), &inbox)
    }

    /// Task state changes broadcast to every known agent, the actor
    /// included.
    pub(crate) fn fan_out_task_event(
        &self,
        event_type: &str,
        task_id: &str,
        actor: &str,
        verb: &str,
    ) -> StoreResult<()> {
        let summary = format!("Task {task_id} {verb} by {actor}");
        let now = Utc::now();
        let mut recipients = self.known_agents()?;
        if !recipients.iter().any(|agent| agent == actor) {
            recipients.push(actor.to_string());
        }
        for agent in recipients {
            self.deliver(
                &agent,
                InboxEvent {
                    cursor: 0,
                    event_type: event_type.to_string(),
                    task_id: Some(task_id.to_string()),
                    thread_id: None,
                    actor: actor.to_string(),
                    summary: summary.clone(),
                    content: None,
                    created_at: now,
                },
            )?;
        }
        debug!(task_id = %task_id, event = %event_type, "Inbox fan-out");
        Ok(())
    }

    /// Thread messages go to every participant except the author.
    pub(crate) fn fan_out_thread_message(
        &self,
        thread: &Thread,
        message: &ThreadMessage,
    ) -> StoreResult<()> {
        let summary = summarize_body(&message.body);
        for participant in &thread.participants {
            if participant == &message.author {
                continue;
            }
            self.deliver(
                participant,
                InboxEvent {
                    cursor: 0,
                    event_type: "thread_message".to_string(),
                    task_id: None,
                    thread_id: Some(thread.thread_id.clone()),
                    actor: message.author.clone(),
                    summary: summary.clone(),
                    content: Some(message.body.clone()),
                    created_at: message.created_at,
                },
            )?;
        }
        Ok(())
    }

    /// Events after the `since` watermark, oldest first.
    pub fn fetch_inbox(&self, agent_id: &str, since: Option<u64>) -> StoreResult<InboxPage> {
        if !valid_ident(agent_id) {
            return Err(StoreError::InvalidAgentId(agent_id.to_string()));
        }
        let inbox = self.read_inbox(agent_id)?;
        let since = since.unwrap_or(0);
        let events: Vec<InboxEvent> = inbox
            .events
            .into_iter()
            .filter(|event| event.cursor > since)
            .collect();
        let next_since = events.iter().map(|e| e.cursor).max().unwrap_or(since);
        Ok(InboxPage { events, next_since })
    }
}

/// First `SUMMARY_LIMIT` bytes of the body, single-line.
fn summarize_body(body: &str) -> String {
    let flattened = body.replace(['\n', '\r'], " ");
    if flattened.len() <= SUMMARY_LIMIT {
        return flattened;
    }
    let mut cut = SUMMARY_LIMIT;
    while !flattened.is_char_boundary(cut) {
        cut -= 1;
    }
    flattened[..cut].to_string()
}
