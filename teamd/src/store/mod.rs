//! The authoritative on-disk model.
//!
//! Layout under `<root>/<teamId>/`:
//!
//! ```text
//! team.json                       team record
//! tasks/<id>.json                 one task per file
//! threads/index.json              thread records
//! threads/<id>.jsonl              one message per line
//! inboxes/<agentId>.json          per-agent notification cache
//! audit/events.jsonl              one audit event per line
//! idempotency/create-task.json    creation key map
//! ```
//!
//! Every mutating operation runs under one serial mutation lock so the
//! store observes a total order of writes. Reads never take the lock:
//! record files are replaced atomically, so a reader sees either the
//! prior record or the new one, never a torn write.

mod audit;
mod inbox;
mod tasks;
mod threads;

pub use inbox::InboxPage;
pub use tasks::{CanWriteDecision, ClaimOutcome, CreateTaskInput, CreatedTask};
pub use threads::{StartThreadInput, ThreadTail};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;

use team_common::error::{StoreError, StoreResult};
use team_common::fs::{safe_join, write_json_atomic};
use team_common::types::{AgentSpec, BudgetHints, Team};
use team_common::{valid_ident, SCHEMA_VERSION};

#[derive(Debug)]
pub struct Store {
    team_id: String,
    workspace_root: PathBuf,
    team_dir: PathBuf,
    mutation: Mutex<()>,
}

impl Store {
    /// Open the store for one team directory. The directory must have
    /// been scaffolded by the bootstrap already.
    pub fn open(workspace_root: &Path, team_id: &str) -> StoreResult<Self> {
        if !valid_ident(team_id) {
            return Err(StoreError::InvalidTeamId(team_id.to_string()));
        }
        let workspace_root = workspace_root.canonicalize()?;
        let team_dir = safe_join(&workspace_root, team_id)?;
        Ok(Self {
            team_id: team_id.to_string(),
            workspace_root,
            team_dir,
            mutation: Mutex::new(()),
        })
    }

    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    pub fn team_dir(&self) -> &Path {
        &self.team_dir
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Scope check used by the HTTP layer: this daemon serves one team.
    pub fn ensure_team(&self, team_id: &str) -> StoreResult<()> {
        if team_id == self.team_id {
            Ok(())
        } else {
            Err(StoreError::TeamNotFound(team_id.to_string()))
        }
    }

    pub(crate) fn team_path(&self) -> PathBuf {
        self.team_dir.join("team.json")
    }

    pub(crate) fn tasks_dir(&self) -> PathBuf {
        self.team_dir.join("tasks")
    }

    pub(crate) fn task_path(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(format!("{task_id}.json"))
    }

    pub(crate) fn threads_dir(&self) -> PathBuf {
        self.team_dir.join("threads")
    }

    pub(crate) fn thread_index_path(&self) -> PathBuf {
        self.threads_dir().join("index.json")
    }

    pub(crate) fn thread_log_path(&self, thread_id: &str) -> PathBuf {
        self.threads_dir().join(format!("{thread_id}.jsonl"))
    }

    pub(crate) fn inboxes_dir(&self) -> PathBuf {
        self.team_dir.join("inboxes")
    }

    pub(crate) fn inbox_path(&self, agent_id: &str) -> PathBuf {
        self.inboxes_dir().join(format!("{agent_id}.json"))
    }

    pub(crate) fn audit_path(&self) -> PathBuf {
        self.team_dir.join("audit").join("events.jsonl")
    }

    pub(crate) fn idempotency_path(&self) -> PathBuf {
        self.team_dir.join("idempotency").join("create-task.json")
    }

    pub(crate) async fn lock_mutations(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.mutation.lock().await
    }

    /// Read the team record; absent means the workspace was never
    /// initialized, which bootstrap prevents.
    pub fn read_team(&self) -> StoreResult<Team> {
        let bytes = match fs::read(self.team_path()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::TeamNotFound(self.team_id.clone()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn list_teams(&self) -> StoreResult<Vec<Team>> {
        Ok(vec![self.read_team()?])
    }

    pub fn get_team(&self, team_id: &str) -> StoreResult<Team> {
        self.ensure_team(team_id)?;
        self.read_team()
    }

    /// Create (or return) the team record. Creation is a no-op when the
    /// record already exists; the core never destroys it.
    pub async fn create_team(
        &self,
        team_id: &str,
        agents: Vec<AgentSpec>,
        budget: Option<BudgetHints>,
    ) -> StoreResult<(Team, bool)> {
        if !valid_ident(team_id) {
            return Err(StoreError::InvalidTeamId(team_id.to_string()));
        }
        self.ensure_team(team_id)
            .map_err(|_| StoreError::InvalidTeamId(team_id.to_string()))?;
        for agent in &agents {
            if !valid_ident(&agent.id) {
                return Err(StoreError::InvalidAgentId(agent.id.clone()));
            }
        }

        let _guard = self.lock_mutations().await;
        if let Ok(existing) = self.read_team() {
            return Ok((existing, false));
        }

        let team = Team {
            schema_version: SCHEMA_VERSION,
            team_id: team_id.to_string(),
            agents,
            budget,
            created_at: Utc::now(),
        };
        self.append_audit("team_created", team_id, None, None, serde_json::json!({}))?;
        write_json_atomic(&self.team_path(), &team)?;
        info!(team_id = %team_id, "Team record created");
        Ok((team, true))
    }

    /// Write the default empty team record if none exists yet. Called
    /// once by the bootstrap, outside the serving path.
    pub fn ensure_default_team(&self) -> StoreResult<()> {
        if self.team_path().exists() {
            return Ok(());
        }
        let team = Team {
            schema_version: SCHEMA_VERSION,
            team_id: self.team_id.clone(),
            agents: Vec::new(),
            budget: None,
            created_at: Utc::now(),
        };
        write_json_atomic(&self.team_path(), &team)
    }

    /// All agents the daemon knows about: the configured team agents
    /// plus anyone who already has an inbox on disk.
    pub(crate) fn known_agents(&self) -> StoreResult<Vec<String>> {
        let mut seen: HashMap<String, ()> = HashMap::new();
        let mut agents = Vec::new();

        if let Ok(team) = self.read_team() {
            for agent in team.agents {
                if seen.insert(agent.id.clone(), ()).is_none() {
                    agents.push(agent.id);
                }
            }
        }

        match fs::read_dir(self.inboxes_dir()) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    let name = entry.file_name();
                    let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                        continue;
                    };
                    if seen.insert(stem.to_string(), ()).is_none() {
                        agents.push(stem.to_string());
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        Ok(agents)
    }

    /// Numeric suffix of `task-NNNN` style identifiers.
    pub(crate) fn id_suffix(id: &str, prefix: &str) -> Option<u64> {
        id.strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|digits| digits.parse().ok())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use team_common::fs::set_dir_private;
    use tempfile::TempDir;

    /// A scaffolded store in a throwaway workspace.
    pub(crate) fn scaffolded(team_id: &str) -> (TempDir, Store) {
        let root = TempDir::new().expect("temp workspace");
        let team_dir = root.path().join(team_id);
        for sub in [
            "tasks",
            "threads",
            "inboxes",
            "audit",
            "artifacts",
            "idempotency",
        ] {
            fs::create_dir_all(team_dir.join(sub)).expect("scaffold");
        }
        set_dir_private(&team_dir).expect("chmod");
        let store = Store::open(root.path(), team_id).expect("open store");
        store.ensure_default_team().expect("default team");
        (root, store)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::scaffolded;
    use super::*;

    #[tokio::test]
    async fn create_team_is_idempotent_and_scoped() {
        let (_root, store) = scaffolded("alpha");

        let agents = vec![AgentSpec {
            id: "worker_a".into(),
            role: "worker".into(),
            model: None,
        }];
        // team.json already exists (default), so this is a no-op read.
        let (team, created) = store
            .create_team("alpha", agents.clone(), None)
            .await
            .expect("create");
        assert!(!created);
        assert_eq!(team.team_id, "alpha");

        let err = store.create_team("beta", vec![], None).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_TEAM_ID");

        let err = store.get_team("beta").unwrap_err();
        assert_eq!(err.code(), "TEAM_NOT_FOUND");
    }

    #[tokio::test]
    async fn known_agents_unions_team_and_inboxes() {
        let (_root, store) = scaffolded("alpha");
        fs::remove_file(store.team_path()).unwrap();
        store
            .create_team(
                "alpha",
                vec![AgentSpec {
                    id: "worker_a".into(),
                    role: "worker".into(),
                    model: None,
                }],
                None,
            )
            .await
            .unwrap();
        write_json_atomic(
            &store.inbox_path("drive_by"),
            &team_common::types::Inbox::empty("drive_by"),
        )
        .unwrap();

        let mut agents = store.known_agents().unwrap();
        agents.sort();
        assert_eq!(agents, vec!["drive_by".to_string(), "worker_a".to_string()]);
    }
}
