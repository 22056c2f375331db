//! Persisted records of the team workspace.
//!
//! Everything the daemon writes to disk or puts on the wire lives here,
//! serialized with the camelCase keys of the workspace file formats.
//! Records never drop fields on read: unknown JSON keys are rejected
//! nowhere, missing optionals default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SCHEMA_VERSION;

fn schema_version_default() -> u32 {
    SCHEMA_VERSION
}

/// One participating agent as configured in `team.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub id: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Optional planning hints; the daemon stores but never interprets them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BudgetHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tasks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// `team.json`, one per workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    #[serde(default = "schema_version_default")]
    pub schema_version: u32,
    pub team_id: String,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetHints>,
    pub created_at: DateTime<Utc>,
}

/// Task lifecycle states. `Canceled` is defined for the wire format but
/// no current operation produces it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Blocked,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// The fencing token: holder, epoch and wall-clock deadline together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub holder: String,
    pub epoch: u64,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// `tasks/<id>.json`, the unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default = "schema_version_default")]
    pub schema_version: u32,
    pub task_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    #[serde(default)]
    pub epoch: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// True when the task holds a lease whose deadline has passed.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease
            .as_ref()
            .map(|lease| lease.expired_at(now))
            .unwrap_or(false)
    }
}

/// One record of `threads/index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    #[serde(default = "schema_version_default")]
    pub schema_version: u32,
    pub thread_id: String,
    pub title: String,
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One line of `threads/<id>.jsonl`. Append-only, never edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMessage {
    #[serde(default = "schema_version_default")]
    pub schema_version: u32,
    pub message_id: String,
    pub thread_id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// `inboxes/<agentId>.json`, a rebuildable notification cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbox {
    #[serde(default = "schema_version_default")]
    pub schema_version: u32,
    pub agent_id: String,
    pub next_cursor: u64,
    #[serde(default)]
    pub events: Vec<InboxEvent>,
}

impl Inbox {
    pub fn empty(agent_id: &str) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            agent_id: agent_id.to_string(),
            next_cursor: 1,
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxEvent {
    pub cursor: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub actor: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One line of `audit/events.jsonl`. Observational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    #[serde(default = "schema_version_default")]
    pub schema_version: u32,
    #[serde(rename = "type")]
    pub event_type: String,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One value of the `idempotency/create-task.json` key map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub task_id: String,
    pub created_at: DateTime<Utc>,
}

/// `runtime.json`, published on startup with mode 0600.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeDescriptor {
    #[serde(default = "schema_version_default")]
    pub schema_version: u32,
    pub url: String,
    pub token: String,
    pub pid: u32,
}

/// `.teamd.lock` payload for single-instance enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockFile {
    #[serde(default = "schema_version_default")]
    pub schema_version: u32,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}
