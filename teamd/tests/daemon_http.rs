//! End-to-end tests against an in-process daemon over real HTTP.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use teamd::bootstrap::{start, DaemonHandle, DaemonOptions};

async fn boot(root: &Path) -> DaemonHandle {
    start(DaemonOptions {
        root: root.to_path_buf(),
        team_id: "alpha".into(),
        port: 0,
        token: None,
    })
    .await
    .expect("daemon start")
}

async fn post(
    client: &reqwest::Client,
    handle: &DaemonHandle,
    path: &str,
    body: Value,
) -> (u16, Value) {
    let response = client
        .post(format!("{}{}", handle.url(), path))
        .bearer_auth(handle.token())
        .json(&body)
        .send()
        .await
        .expect("request");
    let status = response.status().as_u16();
    let body = response.json().await.unwrap_or(Value::Null);
    (status, body)
}

async fn get(client: &reqwest::Client, handle: &DaemonHandle, path: &str) -> (u16, Value) {
    let response = client
        .get(format!("{}{}", handle.url(), path))
        .bearer_auth(handle.token())
        .send()
        .await
        .expect("request");
    let status = response.status().as_u16();
    let body = response.json().await.unwrap_or(Value::Null);
    (status, body)
}

fn error_code(body: &Value) -> &str {
    body["error"]["code"].as_str().unwrap_or_default()
}

#[tokio::test]
async fn healthz_is_open_and_v1_requires_the_token() {
    let root = TempDir::new().unwrap();
    let mut handle = boot(root.path()).await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("{}/healthz", handle.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status().as_u16(), 200);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let denied = client
        .get(format!("{}/v1/tasks?teamId=alpha", handle.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status().as_u16(), 401);
    let body: Value = denied.json().await.unwrap();
    assert_eq!(error_code(&body), "UNAUTHORIZED");

    let wrong = client
        .get(format!("{}/v1/tasks?teamId=alpha", handle.url()))
        .bearer_auth("not-the-token")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status().as_u16(), 401);

    let missing = get(&client, &handle, "/v1/nope").await;
    assert_eq!(missing.0, 404);
    assert_eq!(error_code(&missing.1), "NOT_FOUND");

    handle.close().await;
}

#[tokio::test]
async fn fencing_rejects_a_stale_finalize_and_bumps_epochs() {
    let root = TempDir::new().unwrap();
    let mut handle = boot(root.path()).await;
    let client = reqwest::Client::new();

    let (status, _) = post(&client, &handle, "/v1/tasks", json!({"title": "fenced"})).await;
    assert_eq!(status, 201);

    let (status, claimed) = post(
        &client,
        &handle,
        "/v1/tasks/task-0001/claim",
        json!({"agentId": "worker_a", "ttlMs": 25}),
    )
    .await;
    assert_eq!(status, 200);
    let first_epoch = claimed["lease"]["epoch"].as_u64().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, body) = post(
        &client,
        &handle,
        "/v1/tasks/task-0001/complete",
        json!({"agentId": "worker_a", "epoch": first_epoch}),
    )
    .await;
    assert_eq!(status, 403);
    assert_eq!(error_code(&body), "LEASE_EXPIRED");

    let (status, reclaimed) = post(
        &client,
        &handle,
        "/v1/tasks/task-0001/claim",
        json!({"agentId": "worker_a", "ttlMs": 60000}),
    )
    .await;
    assert_eq!(status, 200);
    assert!(reclaimed["lease"]["epoch"].as_u64().unwrap() > first_epoch);

    handle.close().await;
}

#[tokio::test]
async fn completing_a_dependency_unblocks_the_dependent() {
    let root = TempDir::new().unwrap();
    let mut handle = boot(root.path()).await;
    let client = reqwest::Client::new();

    post(&client, &handle, "/v1/tasks", json!({"title": "base"})).await;
    let (_, dependent) = post(
        &client,
        &handle,
        "/v1/tasks",
        json!({"title": "follow-up", "deps": ["task-0001"]}),
    )
    .await;
    assert_eq!(dependent["task"]["status"], "blocked");

    let (_, claimed) = post(
        &client,
        &handle,
        "/v1/tasks/task-0001/claim",
        json!({"agentId": "worker_a"}),
    )
    .await;
    let epoch = claimed["lease"]["epoch"].as_u64().unwrap();
    let (status, _) = post(
        &client,
        &handle,
        "/v1/tasks/task-0001/complete",
        json!({"agentId": "worker_a", "epoch": epoch}),
    )
    .await;
    assert_eq!(status, 200);

    let (_, task) = get(&client, &handle, "/v1/tasks/task-0002?teamId=alpha").await;
    assert_eq!(task["task"]["status"], "pending");

    handle.close().await;
}

#[tokio::test]
async fn idempotency_key_replays_the_original_creation() {
    let root = TempDir::new().unwrap();
    let mut handle = boot(root.path()).await;
    let client = reqwest::Client::new();

    let send = |body: Value| {
        let client = client.clone();
        let url = format!("{}/v1/tasks", handle.url());
        let token = handle.token().to_string();
        async move {
            let response = client
                .post(url)
                .bearer_auth(token)
                .header("Idempotency-Key", "create-task-1")
                .json(&body)
                .send()
                .await
                .expect("request");
            let status = response.status().as_u16();
            let body: Value = response.json().await.unwrap();
            (status, body)
        }
    };

    let (status, first) = send(json!({"title": "build"})).await;
    assert_eq!(status, 201);
    assert_eq!(first["task"]["taskId"], "task-0001");
    assert_eq!(first["created"], true);

    let (status, second) = send(json!({"title": "build"})).await;
    assert_eq!(status, 200);
    assert_eq!(second["task"]["taskId"], "task-0001");
    assert_eq!(second["created"], false);

    let (_, listing) = get(&client, &handle, "/v1/tasks?teamId=alpha").await;
    assert_eq!(listing["tasks"].as_array().unwrap().len(), 1);

    drop(send);
    handle.close().await;
}

#[tokio::test]
async fn racing_claims_settle_as_one_winner_one_conflict() {
    let root = TempDir::new().unwrap();
    let mut handle = boot(root.path()).await;
    let client = reqwest::Client::new();

    post(&client, &handle, "/v1/tasks", json!({"title": "contested"})).await;

    let (a, b) = tokio::join!(
        post(
            &client,
            &handle,
            "/v1/tasks/task-0001/claim",
            json!({"agentId": "worker_a"})
        ),
        post(
            &client,
            &handle,
            "/v1/tasks/task-0001/claim",
            json!({"agentId": "worker_b"})
        ),
    );

    let mut statuses = [a.0, b.0];
    statuses.sort();
    assert_eq!(statuses, [200, 409]);
    for (status, body) in [a, b] {
        if status == 409 {
            assert_eq!(error_code(&body), "TASK_NOT_CLAIMABLE");
        }
    }

    handle.close().await;
}

#[tokio::test]
async fn restart_recovers_from_a_torn_thread_append() {
    let root = TempDir::new().unwrap();
    let mut handle = boot(root.path()).await;
    let client = reqwest::Client::new();

    post(&client, &handle, "/v1/tasks", json!({"title": "work"})).await;
    let (status, thread) = post(
        &client,
        &handle,
        "/v1/threads",
        json!({"title": "design", "originator": "worker_a", "participants": ["worker_b"]}),
    )
    .await;
    assert_eq!(status, 201);
    let thread_id = thread["thread"]["threadId"].as_str().unwrap().to_string();

    let (status, _) = post(
        &client,
        &handle,
        &format!("/v1/threads/{thread_id}/messages"),
        json!({"agentId": "worker_a", "body": "survives the crash"}),
    )
    .await;
    assert_eq!(status, 201);

    // Crash mid-append: raw fragment without a trailing newline.
    let log_path = handle
        .team_dir()
        .join("threads")
        .join(format!("{thread_id}.jsonl"));
    let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
    file.write_all(b"{\"partial\":").unwrap();

    handle.close().await;
    let mut handle = boot(root.path()).await;

    let (status, tail) = get(
        &reqwest::Client::new(),
        &handle,
        &format!("/v1/threads/{thread_id}/tail?teamId=alpha&limit=10"),
    )
    .await;
    assert_eq!(status, 200);
    let messages = tail["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["body"], "survives the crash");

    let (status, listing) = get(&reqwest::Client::new(), &handle, "/v1/tasks?teamId=alpha").await;
    assert_eq!(status, 200);
    assert_eq!(listing["tasks"].as_array().unwrap().len(), 1);

    handle.close().await;
}

#[tokio::test]
async fn inbox_and_can_write_round_trip() {
    let root = TempDir::new().unwrap();
    let mut handle = boot(root.path()).await;
    let client = reqwest::Client::new();

    post(
        &client,
        &handle,
        "/v1/tasks",
        json!({"title": "edit src", "resources": ["src"]}),
    )
    .await;
    let (_, claimed) = post(
        &client,
        &handle,
        "/v1/tasks/task-0001/claim",
        json!({"agentId": "worker_a"}),
    )
    .await;
    let epoch = claimed["lease"]["epoch"].as_u64().unwrap();

    let (status, allowed) = get(
        &client,
        &handle,
        "/v1/can-write?teamId=alpha&agentId=worker_a&path=src/main.rs",
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(allowed["allow"], true);
    assert_eq!(allowed["reason"], "lease_active_for_resource");

    let (_, denied) = get(
        &client,
        &handle,
        "/v1/can-write?teamId=alpha&agentId=worker_b&path=src/main.rs",
    )
    .await;
    assert_eq!(denied["allow"], false);
    assert_eq!(denied["reason"], "no_active_lease_for_path");

    post(
        &client,
        &handle,
        "/v1/tasks/task-0001/complete",
        json!({"agentId": "worker_a", "epoch": epoch}),
    )
    .await;

    let (status, inbox) = get(
        &client,
        &handle,
        "/v1/inbox?teamId=alpha&agentId=worker_a&since=0",
    )
    .await;
    assert_eq!(status, 200);
    let events = inbox["events"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1]["summary"], "Task task-0001 completed by worker_a");
    let next_since = inbox["nextSince"].as_u64().unwrap();

    let (_, caught_up) = get(
        &client,
        &handle,
        &format!("/v1/inbox?teamId=alpha&agentId=worker_a&since={next_since}"),
    )
    .await;
    assert!(caught_up["events"].as_array().unwrap().is_empty());

    handle.close().await;
}

#[tokio::test]
async fn malformed_bodies_and_missing_scope_are_400s() {
    let root = TempDir::new().unwrap();
    let mut handle = boot(root.path()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/v1/tasks", handle.url()))
        .bearer_auth(handle.token())
        .header("content-type", "application/json")
        .body("{\"title\": ")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(error_code(&body), "INVALID_JSON");

    let (status, body) = post(&client, &handle, "/v1/tasks", json!({"title": "  "})).await;
    assert_eq!(status, 400);
    assert_eq!(error_code(&body), "INVALID_TASK");

    let (status, body) = get(&client, &handle, "/v1/tasks").await;
    assert_eq!(status, 400);
    assert_eq!(error_code(&body), "INVALID_TEAM_ID");

    handle.close().await;
}

#[tokio::test]
async fn unknown_team_scope_is_a_404() {
    let root = TempDir::new().unwrap();
    let mut handle = boot(root.path()).await;
    let client = reqwest::Client::new();

    let (status, body) = get(&client, &handle, "/v1/tasks?teamId=beta").await;
    assert_eq!(status, 404);
    assert_eq!(error_code(&body), "TEAM_NOT_FOUND");

    let (status, body) = get(&client, &handle, "/v1/teams/beta").await;
    assert_eq!(status, 404);
    assert_eq!(error_code(&body), "TEAM_NOT_FOUND");

    let (status, team) = get(&client, &handle, "/v1/teams/alpha").await;
    assert_eq!(status, 200);
    assert_eq!(team["team"]["teamId"], "alpha");

    handle.close().await;
}
