//! Client library for the teamd coordination daemon.
//!
//! Mutating tools route through the daemon's HTTP API, never direct
//! file I/O. The guard half of the crate turns daemon answers into
//! block/allow decisions for a host agent's tool invocations; every
//! failure is a deny, never a spurious allow.

pub mod discovery;
pub mod guard;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use team_common::types::{InboxEvent, Lease, Task, Thread, ThreadMessage};

use crate::discovery::Discovery;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("daemon not reachable: {0}")]
    Transport(String),
    #[error("{code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub task: Task,
    pub lease: Lease,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskResponse {
    pub task: Task,
    pub created: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadTailResponse {
    pub thread: Thread,
    pub messages: Vec<ThreadMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxPage {
    pub events: Vec<InboxEvent>,
    pub next_since: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanWrite {
    pub allow: bool,
    pub reason: String,
}

/// Authenticated HTTP client bound to one discovered daemon identity.
pub struct TeamdClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    team_id: String,
    agent_id: String,
}

impl TeamdClient {
    pub fn new(discovery: Discovery) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: discovery.url.trim_end_matches('/').to_string(),
            token: discovery.token,
            team_id: discovery.team_id,
            agent_id: discovery.agent_id,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: Value,
        idempotency_key: Option<&str>,
    ) -> ClientResult<T> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(&body);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        Self::decode(response).await
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> ClientResult<T> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        Self::decode(response).await
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> ClientResult<T> {
        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(ClientError::Api {
                status,
                code: body["error"]["code"]
                    .as_str()
                    .unwrap_or("INTERNAL_ERROR")
                    .to_string(),
                message: body["error"]["message"].as_str().unwrap_or("").to_string(),
            });
        }
        serde_json::from_value(body).map_err(|err| ClientError::InvalidResponse(err.to_string()))
    }

    pub async fn create_task(
        &self,
        title: &str,
        description: &str,
        deps: &[String],
        resources: &[String],
        idempotency_key: Option<&str>,
    ) -> ClientResult<CreateTaskResponse> {
        self.post(
            "/v1/tasks",
            json!({
                "teamId": self.team_id,
                "title": title,
                "description": description,
                "deps": deps,
                "resources": resources,
            }),
            idempotency_key,
        )
        .await
    }

    pub async fn claim_task(
        &self,
        task_id: &str,
        ttl_ms: Option<u64>,
    ) -> ClientResult<ClaimResponse> {
        let mut body = json!({ "teamId": self.team_id, "agentId": self.agent_id });
        if let Some(ttl) = ttl_ms {
            body["ttlMs"] = json!(ttl);
        }
        self.post(&format!("/v1/tasks/{task_id}/claim"), body, None)
            .await
    }

    pub async fn renew_task(
        &self,
        task_id: &str,
        epoch: u64,
        ttl_ms: Option<u64>,
    ) -> ClientResult<ClaimResponse> {
        let mut body = json!({
            "teamId": self.team_id,
            "agentId": self.agent_id,
            "epoch": epoch,
        });
        if let Some(ttl) = ttl_ms {
            body["ttlMs"] = json!(ttl);
        }
        self.post(&format!("/v1/tasks/{task_id}/renew"), body, None)
            .await
    }

    pub async fn complete_task(&self, task_id: &str, epoch: u64) -> ClientResult<Task> {
        #[derive(Deserialize)]
        struct TaskEnvelope {
            task: Task,
        }
        let envelope: TaskEnvelope = self
            .post(
                &format!("/v1/tasks/{task_id}/complete"),
                json!({ "teamId": self.team_id, "agentId": self.agent_id, "epoch": epoch }),
                None,
            )
            .await?;
        Ok(envelope.task)
    }

    pub async fn fail_task(&self, task_id: &str, epoch: u64) -> ClientResult<Task> {
        #[derive(Deserialize)]
        struct TaskEnvelope {
            task: Task,
        }
        let envelope: TaskEnvelope = self
            .post(
                &format!("/v1/tasks/{task_id}/fail"),
                json!({ "teamId": self.team_id, "agentId": self.agent_id, "epoch": epoch }),
                None,
            )
            .await?;
        Ok(envelope.task)
    }

    pub async fn get_task(&self, task_id: &str) -> ClientResult<Task> {
        #[derive(Deserialize)]
        struct TaskEnvelope {
            task: Task,
        }
        let envelope: TaskEnvelope = self
            .get(&format!("/v1/tasks/{task_id}?teamId={}", self.team_id))
            .await?;
        Ok(envelope.task)
    }

    pub async fn list_tasks(&self) -> ClientResult<Vec<Task>> {
        #[derive(Deserialize)]
        struct TasksEnvelope {
            tasks: Vec<Task>,
        }
        let envelope: TasksEnvelope =
            self.get(&format!("/v1/tasks?teamId={}", self.team_id)).await?;
        Ok(envelope.tasks)
    }

    pub async fn start_thread(
        &self,
        title: &str,
        participants: &[String],
        task_id: Option<&str>,
    ) -> ClientResult<Thread> {
        #[derive(Deserialize)]
        struct ThreadEnvelope {
            thread: Thread,
        }
        let mut body = json!({
            "teamId": self.team_id,
            "title": title,
            "participants": participants,
            "originator": self.agent_id,
        });
        if let Some(task_id) = task_id {
            body["taskId"] = json!(task_id);
        }
        let envelope: ThreadEnvelope = self.post("/v1/threads", body, None).await?;
        Ok(envelope.thread)
    }

    pub async fn post_message(
        &self,
        thread_id: &str,
        body: &str,
    ) -> ClientResult<ThreadMessage> {
        #[derive(Deserialize)]
        struct MessageEnvelope {
            message: ThreadMessage,
        }
        let envelope: MessageEnvelope = self
            .post(
                &format!("/v1/threads/{thread_id}/messages"),
                json!({ "teamId": self.team_id, "agentId": self.agent_id, "body": body }),
                None,
            )
            .await?;
        Ok(envelope.message)
    }

    pub async fn thread_tail(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> ClientResult<ThreadTailResponse> {
        self.get(&format!(
            "/v1/threads/{thread_id}/tail?teamId={}&limit={limit}",
            self.team_id
        ))
        .await
    }

    pub async fn search_threads(&self, query: &str) -> ClientResult<Vec<Thread>> {
        #[derive(Deserialize)]
        struct ThreadsEnvelope {
            threads: Vec<Thread>,
        }
        let envelope: ThreadsEnvelope = self
            .get(&format!(
                "/v1/threads/search?teamId={}&q={}",
                self.team_id,
                urlencode(query)
            ))
            .await?;
        Ok(envelope.threads)
    }

    pub async fn link_thread(&self, thread_id: &str, task_id: &str) -> ClientResult<Thread> {
        #[derive(Deserialize)]
        struct ThreadEnvelope {
            thread: Thread,
        }
        let envelope: ThreadEnvelope = self
            .post(
                &format!("/v1/threads/{thread_id}/link"),
                json!({ "teamId": self.team_id, "taskId": task_id }),
                None,
            )
            .await?;
        Ok(envelope.thread)
    }

    pub async fn fetch_inbox(&self, since: u64) -> ClientResult<InboxPage> {
        self.get(&format!(
            "/v1/inbox?teamId={}&agentId={}&since={since}",
            self.team_id, self.agent_id
        ))
        .await
    }

    /// Write-permission probe. Every transport or API failure is a
    /// deny; the daemon's structured answer passes through unchanged.
    pub async fn can_write(&self, path: &str) -> CanWrite {
        let result: ClientResult<CanWrite> = self
            .get(&format!(
                "/v1/can-write?teamId={}&agentId={}&path={}",
                self.team_id,
                self.agent_id,
                urlencode(path)
            ))
            .await;
        match result {
            Ok(decision) => decision,
            Err(err) => {
                debug!("can-write probe failed: {err}");
                CanWrite {
                    allow: false,
                    reason: "can_write_check_failed".to_string(),
                }
            }
        }
    }
}

/// Minimal percent-encoding for query values.
fn urlencode(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_values_are_percent_encoded() {
        assert_eq!(urlencode("src/main.rs"), "src/main.rs");
        assert_eq!(urlencode("a b"), "a%20b");
        assert_eq!(urlencode("../x"), "../x");
        assert_eq!(urlencode("q&r=1"), "q%26r%3D1");
    }
}
