//! Locating a running daemon from partial information.
//!
//! Precedence: explicit environment > token file > filesystem scan of
//! `<root>/*/runtime.json` by modification time. Discovery tolerates
//! missing pieces; only a missing URL or credential makes it fail, and
//! a missing agent id is synthesized so the guard can always probe.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use team_common::types::RuntimeDescriptor;

pub const ENV_WORKSPACE_ROOT: &str = "TEAM_WORKSPACE_ROOT";
pub const ENV_TEAM_ID: &str = "TEAM_ID";
pub const ENV_AGENT_ID: &str = "AGENT_ID";
pub const ENV_URL: &str = "TEAMD_URL";
pub const ENV_TOKEN: &str = "TEAMD_TOKEN";
pub const ENV_TOKEN_FILE: &str = "TEAMD_TOKEN_FILE";

/// Everything the environment has to say, captured once.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    pub workspace_root: Option<PathBuf>,
    pub team_id: Option<String>,
    pub agent_id: Option<String>,
    pub url: Option<String>,
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
}

impl EnvSnapshot {
    pub fn from_process_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|value| !value.is_empty());
        Self {
            workspace_root: var(ENV_WORKSPACE_ROOT).map(PathBuf::from),
            team_id: var(ENV_TEAM_ID),
            agent_id: var(ENV_AGENT_ID),
            url: var(ENV_URL),
            token: var(ENV_TOKEN),
            token_file: var(ENV_TOKEN_FILE).map(PathBuf::from),
        }
    }
}

/// A complete daemon identity: enough to authenticate every call.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub url: String,
    pub token: String,
    pub team_id: String,
    pub agent_id: String,
}

pub fn discover() -> Option<Discovery> {
    discover_from(EnvSnapshot::from_process_env())
}

pub fn discover_from(env: EnvSnapshot) -> Option<Discovery> {
    let mut url = env.url;
    let mut token = env.token;
    let mut team_id = env.team_id;

    if url.is_none() || token.is_none() {
        if let Some(path) = env.token_file.as_deref() {
            if let Some(file) = read_token_file(path) {
                if token.is_none() {
                    token = file.token;
                }
                if url.is_none() {
                    url = file.url;
                }
            }
        }
    }

    if url.is_none() || token.is_none() {
        if let Some(root) = env.workspace_root.as_deref() {
            if let Some((descriptor, dir_team)) = scan_runtime(root, team_id.as_deref()) {
                debug!(team = %dir_team, url = %descriptor.url, "Discovered daemon from runtime descriptor");
                if url.is_none() {
                    url = Some(descriptor.url);
                }
                if token.is_none() {
                    token = Some(descriptor.token);
                }
                if team_id.is_none() {
                    team_id = Some(dir_team);
                }
            }
        }
    }

    Some(Discovery {
        url: url?,
        token: token?,
        team_id: team_id.unwrap_or_else(|| "default".to_string()),
        agent_id: env.agent_id.unwrap_or_else(default_agent_id),
    })
}

struct TokenFileContents {
    token: Option<String>,
    url: Option<String>,
}

/// A token file is either the raw credential on one line or a JSON
/// object with `token` and optional `url`.
fn read_token_file(path: &Path) -> Option<TokenFileContents> {
    let raw = fs::read_to_string(path).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return Some(TokenFileContents {
                token: value["token"].as_str().map(str::to_string),
                url: value["url"].as_str().map(str::to_string),
            });
        }
    }
    let first_line = trimmed.lines().next()?.trim();
    Some(TokenFileContents {
        token: Some(first_line.to_string()),
        url: None,
    })
}

/// Most recently modified `<root>/<team>/runtime.json`, optionally
/// restricted to one team.
fn scan_runtime(root: &Path, team_filter: Option<&str>) -> Option<(RuntimeDescriptor, String)> {
    let mut best: Option<(std::time::SystemTime, RuntimeDescriptor, String)> = None;
    let entries = fs::read_dir(root).ok()?;
    for entry in entries.flatten() {
        let team_name = entry.file_name().to_string_lossy().into_owned();
        if team_filter.is_some_and(|filter| filter != team_name) {
            continue;
        }
        let candidate = entry.path().join("runtime.json");
        let Ok(meta) = fs::metadata(&candidate) else {
            continue;
        };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        let Ok(bytes) = fs::read(&candidate) else {
            continue;
        };
        let Ok(descriptor) = serde_json::from_slice::<RuntimeDescriptor>(&bytes) else {
            continue;
        };
        let newer = best
            .as_ref()
            .map(|(ts, _, _)| modified > *ts)
            .unwrap_or(true);
        if newer {
            best = Some((modified, descriptor, team_name));
        }
    }
    best.map(|(_, descriptor, team)| (descriptor, team))
}

/// Stable local identity for hosts that never configured one.
fn default_agent_id() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "local".to_string());
    format!("{user}-auto")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(url: &str, token: &str) -> String {
        format!(
            "{{\"schemaVersion\":1,\"url\":\"{url}\",\"token\":\"{token}\",\"pid\":42}}"
        )
    }

    #[test]
    fn explicit_env_wins_over_everything() {
        let discovery = discover_from(EnvSnapshot {
            url: Some("http://127.0.0.1:7777".into()),
            token: Some("env-token".into()),
            team_id: Some("alpha".into()),
            agent_id: Some("worker_a".into()),
            ..Default::default()
        })
        .expect("discovery");
        assert_eq!(discovery.url, "http://127.0.0.1:7777");
        assert_eq!(discovery.token, "env-token");
        assert_eq!(discovery.team_id, "alpha");
        assert_eq!(discovery.agent_id, "worker_a");
    }

    #[test]
    fn token_file_fills_missing_fields() {
        let dir = TempDir::new().unwrap();

        let raw = dir.path().join("token.txt");
        fs::write(&raw, "raw-secret\n").unwrap();
        let discovery = discover_from(EnvSnapshot {
            url: Some("http://127.0.0.1:7777".into()),
            token_file: Some(raw),
            ..Default::default()
        })
        .expect("discovery");
        assert_eq!(discovery.token, "raw-secret");

        let json = dir.path().join("token.json");
        fs::write(
            &json,
            "{\"token\": \"json-secret\", \"url\": \"http://127.0.0.1:8888\"}",
        )
        .unwrap();
        let discovery = discover_from(EnvSnapshot {
            token_file: Some(json),
            ..Default::default()
        })
        .expect("discovery");
        assert_eq!(discovery.token, "json-secret");
        assert_eq!(discovery.url, "http://127.0.0.1:8888");
    }

    #[test]
    fn runtime_scan_prefers_newest_and_honors_team_filter() {
        let root = TempDir::new().unwrap();
        let older = root.path().join("alpha");
        let newer = root.path().join("beta");
        fs::create_dir_all(&older).unwrap();
        fs::create_dir_all(&newer).unwrap();
        fs::write(
            older.join("runtime.json"),
            descriptor("http://127.0.0.1:1111", "alpha-token"),
        )
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(
            newer.join("runtime.json"),
            descriptor("http://127.0.0.1:2222", "beta-token"),
        )
        .unwrap();

        let discovery = discover_from(EnvSnapshot {
            workspace_root: Some(root.path().to_path_buf()),
            agent_id: Some("worker_a".into()),
            ..Default::default()
        })
        .expect("discovery");
        assert_eq!(discovery.team_id, "beta");
        assert_eq!(discovery.token, "beta-token");

        let discovery = discover_from(EnvSnapshot {
            workspace_root: Some(root.path().to_path_buf()),
            team_id: Some("alpha".into()),
            agent_id: Some("worker_a".into()),
            ..Default::default()
        })
        .expect("discovery");
        assert_eq!(discovery.token, "alpha-token");
    }

    #[test]
    fn missing_credential_fails_and_agent_id_is_synthesized() {
        assert!(discover_from(EnvSnapshot::default()).is_none());

        let discovery = discover_from(EnvSnapshot {
            url: Some("http://127.0.0.1:7777".into()),
            token: Some("t".into()),
            ..Default::default()
        })
        .expect("discovery");
        assert!(discovery.agent_id.ends_with("-auto"));
        assert_eq!(discovery.team_id, "default");
    }
}
