//! Daemon startup and single-instance enforcement.
//!
//! Startup is idempotent: scaffolding and the default team record are
//! created only when missing, and a crash-abandoned lock from a dead
//! process is reclaimed with exactly one retry.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use team_common::fs::{safe_join, set_dir_private, write_json_atomic};
use team_common::types::{LockFile, RuntimeDescriptor};
use team_common::{valid_ident, SCHEMA_VERSION};

use crate::http::{router, AppState};
use crate::store::Store;

const LOCK_FILE: &str = ".teamd.lock";
const SCAFFOLD_DIRS: [&str; 6] = [
    "tasks",
    "threads",
    "inboxes",
    "audit",
    "artifacts",
    "idempotency",
];

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub root: PathBuf,
    pub team_id: String,
    /// 0 binds an ephemeral loopback port.
    pub port: u16,
    /// Minted when not supplied.
    pub token: Option<String>,
}

#[derive(Debug)]
pub struct DaemonHandle {
    url: String,
    token: String,
    team_dir: PathBuf,
    lock_path: PathBuf,
    store: Arc<Store>,
    shutdown: Option<oneshot::Sender<()>>,
    serve_task: Option<JoinHandle<std::io::Result<()>>>,
}

impl DaemonHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn team_dir(&self) -> &Path {
        &self.team_dir
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    /// Stop the listener and release the instance lock. Safe to call
    /// once; later drops are no-ops.
    pub async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.serve_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("HTTP listener exited with error: {err}"),
                Err(err) => warn!("serve task join failed: {err}"),
            }
        }
        if fs::remove_file(&self.lock_path).is_ok() {
            info!(lock = %self.lock_path.display(), "Instance lock released");
        }
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        // close() was skipped: tear down without waiting.
        if let Some(task) = self.serve_task.take() {
            task.abort();
        }
        if self.shutdown.take().is_some() {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

/// Bring the daemon up: scaffold the workspace, take the instance
/// lock, bind the loopback listener and publish `runtime.json`.
pub async fn start(options: DaemonOptions) -> Result<DaemonHandle> {
    if !valid_ident(&options.team_id) {
        bail!("invalid team id '{}'", options.team_id);
    }
    fs::create_dir_all(&options.root)
        .with_context(|| format!("failed to create workspace root {}", options.root.display()))?;
    let root = options
        .root
        .canonicalize()
        .with_context(|| format!("failed to resolve workspace root {}", options.root.display()))?;

    let team_dir = safe_join(&root, &options.team_id)?;
    fs::create_dir_all(&team_dir)?;
    set_dir_private(&team_dir)?;
    for sub in SCAFFOLD_DIRS {
        fs::create_dir_all(team_dir.join(sub))?;
    }

    let lock_path = team_dir.join(LOCK_FILE);
    acquire_lock(&lock_path)?;

    match serve(&root, &options, team_dir, lock_path.clone()).await {
        Ok(handle) => Ok(handle),
        Err(err) => {
            // Release the lock on every startup failure past this point.
            let _ = fs::remove_file(&lock_path);
            Err(err)
        }
    }
}

async fn serve(
    root: &Path,
    options: &DaemonOptions,
    team_dir: PathBuf,
    lock_path: PathBuf,
) -> Result<DaemonHandle> {
    let token = options
        .token
        .clone()
        .filter(|token| !token.is_empty())
        .unwrap_or_else(mint_token);

    let store = Arc::new(Store::open(root, &options.team_id)?);
    store.ensure_default_team()?;

    let listener = TcpListener::bind(("127.0.0.1", options.port))
        .await
        .with_context(|| format!("failed to bind 127.0.0.1:{}", options.port))?;
    let addr = listener.local_addr()?;
    let url = format!("http://{addr}");

    let descriptor = RuntimeDescriptor {
        schema_version: SCHEMA_VERSION,
        url: url.clone(),
        token: token.clone(),
        pid: std::process::id(),
    };
    write_json_atomic(&team_dir.join("runtime.json"), &descriptor)?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router(AppState::new(store.clone(), &token));
    let serve_task = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    info!(url = %url, team_dir = %team_dir.display(), "teamd listening");
    Ok(DaemonHandle {
        url,
        token,
        team_dir,
        lock_path,
        store,
        shutdown: Some(shutdown_tx),
        serve_task: Some(serve_task),
    })
}

/// Exclusive-create the lock file. A holder that is demonstrably dead
/// is reclaimed once; anything else is an actionable failure.
fn acquire_lock(lock_path: &Path) -> Result<()> {
    for attempt in 0..2 {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(mut file) => {
                let payload = LockFile {
                    schema_version: SCHEMA_VERSION,
                    pid: std::process::id(),
                    started_at: Utc::now(),
                };
                let mut line = serde_json::to_string(&payload)?;
                line.push('\n');
                file.write_all(line.as_bytes())?;
                file.sync_all()?;
                team_common::fs::set_file_private(lock_path)?;
                return Ok(());
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder: Option<LockFile> = fs::read(lock_path)
                    .ok()
                    .and_then(|bytes| serde_json::from_slice(&bytes).ok());
                match holder {
                    Some(lock) if attempt == 0 && process_is_dead(lock.pid) => {
                        warn!(
                            pid = lock.pid,
                            lock = %lock_path.display(),
                            "Reclaiming lock from dead daemon"
                        );
                        fs::remove_file(lock_path).with_context(|| {
                            format!("failed to remove stale lock {}", lock_path.display())
                        })?;
                    }
                    Some(lock) => bail!(
                        "teamd is already running for this team (pid {}); \
                         stop it or remove {} if the pid is stale",
                        lock.pid,
                        lock_path.display()
                    ),
                    None => bail!(
                        "lock file {} exists but cannot be read; \
                         remove it if no daemon is running",
                        lock_path.display()
                    ),
                }
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to create lock {}", lock_path.display()))
            }
        }
    }
    bail!("could not acquire lock {}", lock_path.display())
}

#[cfg(unix)]
fn process_is_dead(pid: u32) -> bool {
    // kill(pid, 0) probes existence without signaling.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return false;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn process_is_dead(_pid: u32) -> bool {
    false
}

fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
