//! Task lifecycle: creation, claim/renew/finalize with lease + epoch
//! fencing, dependency unblocking and the write-permission check.

use std::fs;
use std::path::Path;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use team_common::error::{StoreError, StoreResult};
use team_common::fs::{safe_join, write_json_atomic};
use team_common::types::{IdempotencyRecord, Lease, Task, TaskStatus};
use team_common::{normalize_resource, resource_covers, valid_ident, SCHEMA_VERSION};

use super::Store;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskInput {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTask {
    pub task: Task,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimOutcome {
    pub task: Task,
    pub lease: Lease,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanWriteDecision {
    pub allow: bool,
    pub reason: &'static str,
}

impl CanWriteDecision {
    fn deny(reason: &'static str) -> Self {
        Self {
            allow: false,
            reason,
        }
    }
}

impl Store {
    pub fn read_task(&self, task_id: &str) -> StoreResult<Task> {
        let bytes = match fs::read(self.task_path(task_id)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::TaskNotFound(task_id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_task(&self, task: &Task) -> StoreResult<()> {
        write_json_atomic(&self.task_path(&task.task_id), task)
    }

    /// Every task on disk, ordered by identifier.
    pub fn list_tasks(&self) -> StoreResult<Vec<Task>> {
        let mut tasks = Vec::new();
        match fs::read_dir(self.tasks_dir()) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    let name = entry.file_name();
                    let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                        continue;
                    };
                    tasks.push(self.read_task(stem)?);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(tasks)
    }

    /// One plus the highest numeric suffix on disk, zero-padded.
    fn next_task_id(&self) -> StoreResult<String> {
        let mut max = 0u64;
        match fs::read_dir(self.tasks_dir()) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    let name = entry.file_name();
                    let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                        continue;
                    };
                    if let Some(suffix) = Self::id_suffix(stem, "task") {
                        max = max.max(suffix);
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(format!("task-{:04}", max + 1))
    }

    pub async fn create_task(&self, input: CreateTaskInput) -> StoreResult<CreatedTask> {
        let title = input.title.trim().to_string();
        if title.is_empty() {
            return Err(StoreError::InvalidTask("title is required".into()));
        }

        let mut resources = Vec::new();
        for raw in &input.resources {
            let normalized = normalize_resource(raw)
                .ok_or_else(|| StoreError::InvalidTask(format!("invalid resource '{raw}'")))?;
            if !resources.contains(&normalized) {
                resources.push(normalized);
            }
        }

        let _guard = self.lock_mutations().await;

        for dep in &input.deps {
            if !valid_ident(dep) {
                return Err(StoreError::InvalidTask(format!("invalid dependency '{dep}'")));
            }
            if !self.task_path(dep).exists() {
                return Err(StoreError::InvalidTask(format!("unknown dependency '{dep}'")));
            }
        }

        // Replay of a recorded idempotency key returns the original
        // task; the first payload wins.
        if let Some(key) = input.idempotency_key.as_deref() {
            let keys = self.read_idempotency()?;
            if let Some(record) = keys.get(key) {
                let task = self.read_task(&record.task_id)?;
                debug!(task_id = %task.task_id, key = %key, "Idempotent task creation replayed");
                return Ok(CreatedTask {
                    task,
                    created: false,
                });
            }
        }

        let now = Utc::now();
        let status = if self.deps_satisfied(&input.deps)? {
            TaskStatus::Pending
        } else {
            TaskStatus::Blocked
        };

        let task = Task {
            schema_version: SCHEMA_VERSION,
            task_id: self.next_task_id()?,
            title,
            description: input.description,
            status,
            owner: None,
            deps: input.deps,
            resources,
            lease: None,
            epoch: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
        };

        self.append_audit(
            "task_created",
            "daemon",
            Some(&task.task_id),
            None,
            serde_json::json!({ "title": task.title, "status": task.status }),
        )?;
        self.write_task(&task)?;

        if let Some(key) = input.idempotency_key.as_deref() {
            let mut keys = self.read_idempotency()?;
            keys.insert(
                key.to_string(),
                IdempotencyRecord {
                    task_id: task.task_id.clone(),
                    created_at: now,
                },
            );
            write_json_atomic(&self.idempotency_path(), &keys)?;
        }

        info!(task_id = %task.task_id, status = ?task.status, "Task created");
        Ok(CreatedTask {
            task,
            created: true,
        })
    }

    pub async fn claim_task(
        &self,
        task_id: &str,
        agent_id: &str,
        ttl_ms: u64,
    ) -> StoreResult<ClaimOutcome> {
        if !valid_ident(agent_id) {
            return Err(StoreError::InvalidAgentId(agent_id.to_string()));
        }

        let _guard = self.lock_mutations().await;
        let mut task = self.read_task(task_id)?;
        let now = Utc::now();

        // A lease that timed out is silently reset before deciding.
        if task.lease_expired(now) {
            warn!(task_id = %task_id, "Expired lease reset before claim");
            task.status = TaskStatus::Pending;
            task.lease = None;
            task.owner = None;
        }

        if task.status != TaskStatus::Pending {
            return Err(StoreError::TaskNotClaimable(task_id.to_string()));
        }

        task.epoch += 1;
        let lease = Lease {
            holder: agent_id.to_string(),
            epoch: task.epoch,
            expires_at: now + Duration::milliseconds(ttl_ms as i64),
        };
        task.lease = Some(lease.clone());
        task.owner = Some(agent_id.to_string());
        task.status = TaskStatus::InProgress;
        if task.started_at.is_none() {
            task.started_at = Some(now);
        }

        self.append_audit(
            "task_claimed",
            agent_id,
            Some(task_id),
            None,
            serde_json::json!({ "epoch": task.epoch, "expiresAt": lease.expires_at }),
        )?;
        self.write_task(&task)?;
        self.fan_out_task_event("task_claimed", task_id, agent_id, "claimed")?;

        info!(task_id = %task_id, agent_id = %agent_id, epoch = task.epoch, "Task claimed");
        Ok(ClaimOutcome { task, lease })
    }

    pub async fn renew_task(
        &self,
        task_id: &str,
        agent_id: &str,
        epoch: u64,
        ttl_ms: u64,
    ) -> StoreResult<ClaimOutcome> {
        let _guard = self.lock_mutations().await;
        let mut task = self.read_task(task_id)?;
        let now = Utc::now();
        Self::check_fence(&task, agent_id, epoch, now)?;

        let Some(lease) = task.lease.as_mut() else {
            return Err(StoreError::TaskNotInProgress(task_id.to_string()));
        };
        lease.expires_at = now + Duration::milliseconds(ttl_ms as i64);
        let lease = lease.clone();

        self.append_audit(
            "task_renewed",
            agent_id,
            Some(task_id),
            None,
            serde_json::json!({ "epoch": epoch, "expiresAt": lease.expires_at }),
        )?;
        self.write_task(&task)?;

        debug!(task_id = %task_id, agent_id = %agent_id, "Lease renewed");
        Ok(ClaimOutcome { task, lease })
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        agent_id: &str,
        epoch: u64,
    ) -> StoreResult<Task> {
        self.finalize_task(task_id, agent_id, epoch, TaskStatus::Completed)
            .await
    }

    pub async fn fail_task(&self, task_id: &str, agent_id: &str, epoch: u64) -> StoreResult<Task> {
        self.finalize_task(task_id, agent_id, epoch, TaskStatus::Failed)
            .await
    }

    async fn finalize_task(
        &self,
        task_id: &str,
        agent_id: &str,
        epoch: u64,
        terminal: TaskStatus,
    ) -> StoreResult<Task> {
        let _guard = self.lock_mutations().await;
        let mut task = self.read_task(task_id)?;
        let now = Utc::now();
        Self::check_fence(&task, agent_id, epoch, now)?;

        task.lease = None;
        task.status = terminal;
        let (event_type, verb) = match terminal {
            TaskStatus::Completed => {
                task.completed_at = Some(now);
                ("task_completed", "completed")
            }
            _ => {
                task.failed_at = Some(now);
                ("task_failed", "failed")
            }
        };

        self.append_audit(
            event_type,
            agent_id,
            Some(task_id),
            None,
            serde_json::json!({ "epoch": epoch }),
        )?;
        self.write_task(&task)?;
        self.fan_out_task_event(event_type, task_id, agent_id, verb)?;

        if terminal == TaskStatus::Completed {
            self.unblock_dependents(task_id, agent_id)?;
        }

        info!(task_id = %task_id, agent_id = %agent_id, status = ?terminal, "Task finalized");
        Ok(task)
    }

    /// The fencing token is the triple (holder, epoch, expiresAt); a
    /// stale finalize fails on whichever part went stale first.
    fn check_fence(
        task: &Task,
        agent_id: &str,
        epoch: u64,
        now: chrono::DateTime<Utc>,
    ) -> StoreResult<()> {
        if task.status != TaskStatus::InProgress {
            return Err(StoreError::TaskNotInProgress(task.task_id.clone()));
        }
        let Some(lease) = task.lease.as_ref() else {
            return Err(StoreError::TaskNotInProgress(task.task_id.clone()));
        };
        if lease.expired_at(now) {
            return Err(StoreError::LeaseExpired(task.task_id.clone()));
        }
        if lease.epoch != epoch {
            return Err(StoreError::EpochMismatch {
                task: task.task_id.clone(),
                current: lease.epoch,
                presented: epoch,
            });
        }
        if lease.holder != agent_id {
            return Err(StoreError::LeaseHolderMismatch {
                task: task.task_id.clone(),
                holder: lease.holder.clone(),
            });
        }
        Ok(())
    }

    fn deps_satisfied(&self, deps: &[String]) -> StoreResult<bool> {
        for dep in deps {
            if self.read_task(dep)?.status != TaskStatus::Completed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Completion of `task_id` may satisfy the last outstanding
    /// dependency of blocked tasks; flip those to pending.
    fn unblock_dependents(&self, task_id: &str, actor: &str) -> StoreResult<()> {
        for mut task in self.list_tasks()? {
            if task.status != TaskStatus::Blocked || !task.deps.iter().any(|d| d == task_id) {
                continue;
            }
            if self.deps_satisfied(&task.deps)? {
                task.status = TaskStatus::Pending;
                self.append_audit(
                    "task_unblocked",
                    actor,
                    Some(&task.task_id),
                    None,
                    serde_json::json!({ "completedDependency": task_id }),
                )?;
                self.write_task(&task)?;
                info!(task_id = %task.task_id, dependency = %task_id, "Task unblocked");
            }
        }
        Ok(())
    }

    /// Write-permission probe for guard clients. Always structured;
    /// every failure mode is a deny, never an error.
    pub fn can_write(&self, agent_id: &str, raw_path: &str) -> CanWriteDecision {
        if !valid_ident(agent_id) {
            return CanWriteDecision::deny("no_active_lease_for_path");
        }
        let trimmed = raw_path.trim();
        if trimmed.is_empty() {
            return CanWriteDecision::deny("invalid_path");
        }

        let unified = trimmed.replace('\\', "/");
        let candidate = if Path::new(&unified).is_absolute() {
            match Path::new(&unified).strip_prefix(self.workspace_root()) {
                Ok(rel) => rel.to_string_lossy().into_owned(),
                Err(_) => return CanWriteDecision::deny("invalid_path"),
            }
        } else {
            unified
        };

        if candidate.split('/').any(|segment| segment == "..") {
            return CanWriteDecision::deny("path_traversal_denied");
        }

        let Some(normalized) = normalize_resource(&candidate) else {
            // "." and friends resolve to the root itself, which no
            // resource prefix can cover.
            return CanWriteDecision::deny("no_active_lease_for_path");
        };

        match safe_join(self.workspace_root(), &normalized) {
            Ok(_) => {}
            Err(StoreError::PathTraversal(_)) | Err(StoreError::SymlinkEscape(_)) => {
                return CanWriteDecision::deny("path_traversal_denied")
            }
            Err(_) => return CanWriteDecision::deny("invalid_path"),
        }

        let now = Utc::now();
        let tasks = match self.list_tasks() {
            Ok(tasks) => tasks,
            Err(_) => return CanWriteDecision::deny("no_active_lease_for_path"),
        };
        for task in tasks {
            if task.status != TaskStatus::InProgress {
                continue;
            }
            let Some(lease) = task.lease.as_ref() else {
                continue;
            };
            if lease.expired_at(now) || lease.holder != agent_id {
                continue;
            }
            if task
                .resources
                .iter()
                .any(|resource| resource_covers(resource, &normalized))
            {
                return CanWriteDecision {
                    allow: true,
                    reason: "lease_active_for_resource",
                };
            }
        }
        CanWriteDecision::deny("no_active_lease_for_path")
    }

    fn read_idempotency(
        &self,
    ) -> StoreResult<std::collections::BTreeMap<String, IdempotencyRecord>> {
        let bytes = match fs::read(self.idempotency_path()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Default::default())
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}
