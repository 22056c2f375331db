//! Loopback HTTP surface over the store.
//!
//! One fixed verb/path vocabulary; every `/v1/*` route requires the
//! bearer credential minted at bootstrap. Handlers parse request bodies
//! by hand so malformed JSON maps to the wire taxonomy instead of the
//! framework's default rejection.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path, Query},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use team_common::error::StoreError;

use crate::store::{CreateTaskInput, StartThreadInput, Store};
use crate::DAEMON_VERSION;

/// Default lease TTL when a claim does not name one (15 minutes).
const DEFAULT_TTL_MS: u64 = 900_000;
const DEFAULT_TAIL_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    store: Arc<Store>,
    token: Arc<str>,
}

impl AppState {
    pub fn new(store: Arc<Store>, token: &str) -> Self {
        Self {
            store,
            token: token.into(),
        }
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let raw = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::trim);
        let Some(raw) = raw else {
            return Err(StoreError::Unauthorized.into());
        };
        let presented = raw
            .strip_prefix("Bearer ")
            .or_else(|| raw.strip_prefix("bearer "))
            .unwrap_or(raw)
            .trim();
        if presented == self.token.as_ref() {
            Ok(())
        } else {
            Err(StoreError::Unauthorized.into())
        }
    }

    /// `teamId` query parameter must name the team this daemon serves.
    fn check_team_param(&self, params: &HashMap<String, String>) -> Result<(), ApiError> {
        match params.get("teamId") {
            Some(team_id) => Ok(self.store.ensure_team(team_id)?),
            None => Err(StoreError::InvalidTeamId("missing teamId".into()).into()),
        }
    }

    /// `teamId` in request bodies is optional but checked when present.
    fn check_team_value(&self, value: &Value) -> Result<(), ApiError> {
        if let Some(team_id) = value.get("teamId").and_then(Value::as_str) {
            self.store.ensure_team(team_id)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("request failed: {:#}", self.0);
        }
        let body = json!({
            "error": { "code": self.0.code(), "message": self.0.to_string() }
        });
        (status, Json(body)).into_response()
    }
}

fn parse_body(body: &Bytes) -> Result<Value, ApiError> {
    serde_json::from_slice(body)
        .map_err(|err| StoreError::InvalidJson(err.to_string()).into())
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value)
        .map_err(|err| StoreError::InvalidJson(err.to_string()).into())
}

fn ok_json<T: serde::Serialize>(value: &T) -> Result<Response, ApiError> {
    let value = serde_json::to_value(value).map_err(StoreError::from)?;
    Ok((StatusCode::OK, Json(value)).into_response())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/teams", get(list_teams).post(create_team))
        .route("/v1/teams/:id", get(get_team))
        .route("/v1/tasks", get(list_tasks).post(create_task))
        .route("/v1/tasks/:id", get(get_task))
        .route("/v1/tasks/:id/claim", post(claim_task))
        .route("/v1/tasks/:id/renew", post(renew_task))
        .route("/v1/tasks/:id/complete", post(complete_task))
        .route("/v1/tasks/:id/fail", post(fail_task))
        .route("/v1/threads", post(start_thread))
        .route("/v1/threads/search", get(search_threads))
        .route("/v1/threads/:id/messages", post(post_message))
        .route("/v1/threads/:id/tail", get(thread_tail))
        .route("/v1/threads/:id/link", post(link_thread))
        .route("/v1/inbox", get(fetch_inbox))
        .route("/v1/can-write", get(can_write))
        .fallback(not_found)
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": DAEMON_VERSION }))
}

async fn not_found() -> Response {
    let body = json!({
        "error": { "code": "NOT_FOUND", "message": "unknown route" }
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

async fn list_teams(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    let teams = state.store.list_teams()?;
    ok_json(&json!({ "teams": teams }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTeamBody {
    team_id: String,
    #[serde(default)]
    agents: Vec<team_common::types::AgentSpec>,
    #[serde(default)]
    budget: Option<team_common::types::BudgetHints>,
}

async fn create_team(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    let value = parse_body(&body)?;
    let body: CreateTeamBody = decode(value)?;
    let (team, created) = state
        .store
        .create_team(&body.team_id, body.agents, body.budget)
        .await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let value = serde_json::to_value(json!({ "team": team })).map_err(StoreError::from)?;
    Ok((status, Json(value)).into_response())
}

async fn get_team(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Path(team_id): Path<String>,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    let team = state.store.get_team(&team_id)?;
    ok_json(&json!({ "team": team }))
}

async fn list_tasks(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    state.check_team_param(&params)?;
    let tasks = state.store.list_tasks()?;
    ok_json(&json!({ "tasks": tasks }))
}

async fn create_task(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    let value = parse_body(&body)?;
    state.check_team_value(&value)?;
    let mut input: CreateTaskInput = decode(value)?;
    if let Some(key) = headers
        .get("idempotency-key")
        .and_then(|value| value.to_str().ok())
    {
        input.idempotency_key = Some(key.trim().to_string());
    }
    let created = state.store.create_task(input).await?;
    let status = if created.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let value = serde_json::to_value(&created).map_err(StoreError::from)?;
    Ok((status, Json(value)).into_response())
}

async fn get_task(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    state.check_team_param(&params)?;
    let task = state.store.read_task(&task_id)?;
    ok_json(&json!({ "task": task }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimBody {
    agent_id: String,
    #[serde(default)]
    ttl_ms: Option<u64>,
}

async fn claim_task(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    let value = parse_body(&body)?;
    state.check_team_value(&value)?;
    let body: ClaimBody = decode(value)?;
    let outcome = state
        .store
        .claim_task(&task_id, &body.agent_id, body.ttl_ms.unwrap_or(DEFAULT_TTL_MS))
        .await?;
    ok_json(&outcome)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenewBody {
    agent_id: String,
    epoch: u64,
    #[serde(default)]
    ttl_ms: Option<u64>,
}

async fn renew_task(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    let value = parse_body(&body)?;
    state.check_team_value(&value)?;
    let body: RenewBody = decode(value)?;
    let outcome = state
        .store
        .renew_task(
            &task_id,
            &body.agent_id,
            body.epoch,
            body.ttl_ms.unwrap_or(DEFAULT_TTL_MS),
        )
        .await?;
    ok_json(&outcome)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeBody {
    agent_id: String,
    epoch: u64,
}

async fn complete_task(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    let value = parse_body(&body)?;
    state.check_team_value(&value)?;
    let body: FinalizeBody = decode(value)?;
    let task = state
        .store
        .complete_task(&task_id, &body.agent_id, body.epoch)
        .await?;
    ok_json(&json!({ "task": task }))
}

async fn fail_task(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    let value = parse_body(&body)?;
    state.check_team_value(&value)?;
    let body: FinalizeBody = decode(value)?;
    let task = state
        .store
        .fail_task(&task_id, &body.agent_id, body.epoch)
        .await?;
    ok_json(&json!({ "task": task }))
}

async fn start_thread(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    let value = parse_body(&body)?;
    state.check_team_value(&value)?;
    let input: StartThreadInput = decode(value)?;
    let thread = state.store.start_thread(input).await?;
    let value =
        serde_json::to_value(json!({ "thread": thread })).map_err(StoreError::from)?;
    Ok((StatusCode::CREATED, Json(value)).into_response())
}

async fn search_threads(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    state.check_team_param(&params)?;
    let query = params.get("q").map(String::as_str).unwrap_or_default();
    let threads = state.store.search_threads(query)?;
    ok_json(&json!({ "threads": threads }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostMessageBody {
    agent_id: String,
    body: String,
}

async fn post_message(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    let value = parse_body(&body)?;
    state.check_team_value(&value)?;
    let body: PostMessageBody = decode(value)?;
    let message = state
        .store
        .post_message(&thread_id, &body.agent_id, &body.body)
        .await?;
    let value =
        serde_json::to_value(json!({ "message": message })).map_err(StoreError::from)?;
    Ok((StatusCode::CREATED, Json(value)).into_response())
}

async fn thread_tail(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    state.check_team_param(&params)?;
    let limit = params
        .get("limit")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_TAIL_LIMIT);
    let tail = state.store.read_thread_tail(&thread_id, limit)?;
    ok_json(&tail)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkBody {
    task_id: String,
}

async fn link_thread(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    let value = parse_body(&body)?;
    state.check_team_value(&value)?;
    let body: LinkBody = decode(value)?;
    let thread = state.store.link_thread(&thread_id, &body.task_id).await?;
    ok_json(&json!({ "thread": thread }))
}

async fn fetch_inbox(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    state.check_team_param(&params)?;
    let agent_id = params.get("agentId").map(String::as_str).unwrap_or_default();
    let since = match params.get("since") {
        Some(raw) => Some(
            raw.parse()
                .map_err(|_| StoreError::InvalidJson("since must be an integer".into()))?,
        ),
        None => None,
    };
    let page = state.store.fetch_inbox(agent_id, since)?;
    ok_json(&page)
}

async fn can_write(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    state.check_team_param(&params)?;
    let agent_id = params.get("agentId").map(String::as_str).unwrap_or_default();
    let path = params.get("path").map(String::as_str).unwrap_or_default();
    let decision = state.store.can_write(agent_id, path);
    ok_json(&decision)
}
