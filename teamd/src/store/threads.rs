//! Durable discussion threads.
//!
//! Thread records live in one index file; messages are an append-only
//! line log per thread, read through the tolerant tail reader so a
//! crash-interrupted append never loses committed lines.

use std::fs;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use team_common::error::{StoreError, StoreResult};
use team_common::fs::{append_json_line, read_json_lines, write_json_atomic};
use team_common::types::{Thread, ThreadMessage};
use team_common::{valid_ident, SCHEMA_VERSION};

use super::Store;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartThreadInput {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub originator: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadTail {
    pub thread: Thread,
    pub messages: Vec<ThreadMessage>,
}

impl Store {
    fn read_thread_index(&self) -> StoreResult<Vec<Thread>> {
        let bytes = match fs::read(self.thread_index_path()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_thread_index(&self, threads: &[Thread]) -> StoreResult<()> {
        write_json_atomic(&self.thread_index_path(), &threads)
    }

    pub fn read_thread(&self, thread_id: &str) -> StoreResult<Thread> {
        self.read_thread_index()?
            .into_iter()
            .find(|thread| thread.thread_id == thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))
    }

    fn next_thread_id(&self) -> StoreResult<String> {
        let max = self
            .read_thread_index()?
            .iter()
            .filter_map(|thread| Self::id_suffix(&thread.thread_id, "thread"))
            .max()
            .unwrap_or(0);
        Ok(format!("thread-{:04}", max + 1))
    }

    pub async fn start_thread(&self, input: StartThreadInput) -> StoreResult<Thread> {
        // Ordered unique participant set, originator first.
        let mut participants = Vec::new();
        let originator = input.originator.clone();
        for candidate in originator.iter().chain(input.participants.iter()) {
            if !valid_ident(candidate) {
                return Err(StoreError::InvalidAgentId(candidate.clone()));
            }
            if !participants.contains(candidate) {
                participants.push(candidate.clone());
            }
        }

        let _guard = self.lock_mutations().await;
        if let Some(task_id) = input.task_id.as_deref() {
            // Linked task must exist.
            self.read_task(task_id)?;
        }

        let now = Utc::now();
        let thread = Thread {
            schema_version: SCHEMA_VERSION,
            thread_id: self.next_thread_id()?,
            title: input.title,
            participants,
            task_id: input.task_id,
            created_at: now,
            updated_at: now,
        };

        let actor = originator.as_deref().unwrap_or("daemon");
        self.append_audit(
            "thread_started",
            actor,
            thread.task_id.as_deref(),
            Some(&thread.thread_id),
            serde_json::json!({ "title": thread.title }),
        )?;
        let mut index = self.read_thread_index()?;
        index.push(thread.clone());
        self.write_thread_index(&index)?;

        info!(thread_id = %thread.thread_id, "Thread started");
        Ok(thread)
    }

    pub async fn post_message(
        &self,
        thread_id: &str,
        agent_id: &str,
        body: &str,
    ) -> StoreResult<ThreadMessage> {
        if !valid_ident(agent_id) {
            return Err(StoreError::InvalidAgentId(agent_id.to_string()));
        }
        if body.trim().is_empty() {
            return Err(StoreError::InvalidThreadMessage("empty body".into()));
        }

        let _guard = self.lock_mutations().await;
        let mut index = self.read_thread_index()?;
        let Some(thread) = index
            .iter_mut()
            .find(|thread| thread.thread_id == thread_id)
        else {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        };

        let now = Utc::now();
        let message = ThreadMessage {
            schema_version: SCHEMA_VERSION,
            message_id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            author: agent_id.to_string(),
            body: body.to_string(),
            created_at: now,
        };

        self.append_audit(
            "thread_message_posted",
            agent_id,
            None,
            Some(thread_id),
            serde_json::json!({ "messageId": message.message_id }),
        )?;
        append_json_line(&self.thread_log_path(thread_id), &message)?;
        thread.updated_at = now;
        let thread_snapshot = thread.clone();
        self.write_thread_index(&index)?;
        self.fan_out_thread_message(&thread_snapshot, &message)?;

        Ok(message)
    }

    /// The last `limit` committed messages, oldest first.
    pub fn read_thread_tail(&self, thread_id: &str, limit: usize) -> StoreResult<ThreadTail> {
        let thread = self.read_thread(thread_id)?;
        let mut messages: Vec<ThreadMessage> =
            read_json_lines(&self.thread_log_path(thread_id))?;
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Ok(ThreadTail { thread, messages })
    }

    /// Case-insensitive title search.
    pub fn search_threads(&self, query: &str) -> StoreResult<Vec<Thread>> {
        let needle = query.to_lowercase();
        Ok(self
            .read_thread_index()?
            .into_iter()
            .filter(|thread| needle.is_empty() || thread.title.to_lowercase().contains(&needle))
            .collect())
    }

    pub async fn link_thread(&self, thread_id: &str, task_id: &str) -> StoreResult<Thread> {
        let _guard = self.lock_mutations().await;
        self.read_task(task_id)?;

        let mut index = self.read_thread_index()?;
        let Some(thread) = index
            .iter_mut()
            .find(|thread| thread.thread_id == thread_id)
        else {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        };

        thread.task_id = Some(task_id.to_string());
        thread.updated_at = Utc::now();
        let snapshot = thread.clone();

        self.append_audit(
            "thread_linked",
            "daemon",
            Some(task_id),
            Some(thread_id),
            serde_json::json!({}),
        )?;
        self.write_thread_index(&index)?;

        info!(thread_id = %thread_id, task_id = %task_id, "Thread linked to task");
        Ok(snapshot)
    }
}
