//! Unix socket JSON-RPC server, the request layer.
//!
//! Listens on `<data_dir>/usage_monitor.sock` for newline-delimited
//! JSON-RPC 2.0 requests. Local-only and unauthenticated; the socket is
//! created owner-only.
//!
//! Group mutations go through the store first and are then reported to
//! the scheduler through its lifecycle hooks. This layer never writes
//! usage records.

use anyhow::Result;
use chrono::{TimeDelta, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use crate::scheduler::CadenceScheduler;
use crate::store::reports::{daily_rollup, RecordView};
use crate::store::{GroupUpdate, Store, StoreError};

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const OPERATION_FAILED: i32 = -32000;

/// Bound on one connection's total request bytes.
const MAX_REQUEST_BYTES: u64 = 1_048_576;

// ── JSON-RPC Types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    params: Option<Value>,
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0".into(), result: Some(result), error: None, id }
    }
    fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self { jsonrpc: "2.0".into(), result: None, error: Some(JsonRpcError { code, message }), id }
    }

    /// Validation problems are the caller's fault; anything else is ours.
    fn from_error(id: Option<Value>, err: anyhow::Error) -> Self {
        match err.downcast_ref::<StoreError>() {
            Some(store_err) => Self::error(id, INVALID_PARAMS, store_err.to_string()),
            None => Self::error(id, OPERATION_FAILED, format!("{:#}", err)),
        }
    }

    fn from_result<T: Serialize>(id: Option<Value>, result: Result<T>) -> Self {
        match result.and_then(|v| Ok(serde_json::to_value(v)?)) {
            Ok(v) => Self::success(id, v),
            Err(e) => Self::from_error(id, e),
        }
    }
}

// ── Server ──────────────────────────────────────────────────────────

/// State shared by every connection.
pub struct AppState {
    pub store: Arc<Store>,
    pub scheduler: Arc<CadenceScheduler>,
    pub default_interval_secs: i64,
}

pub struct Server {
    socket_path: PathBuf,
    state: Arc<AppState>,
}

impl Server {
    pub fn new(socket_path: PathBuf, state: Arc<AppState>) -> Self {
        Self { socket_path, state }
    }

    pub async fn run(&self) -> Result<()> {
        // Remove stale socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(socket = %self.socket_path.display(), "Usage monitor listening");

        loop {
            let (stream, _) = listener.accept().await?;
            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                let mut reader = BufReader::new(reader.take(MAX_REQUEST_BYTES));
                let mut line = String::new();

                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break,
                        Ok(_) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            let response = handle_request(&line, &state).await;
                            let resp_json = serde_json::to_string(&response).unwrap_or_default();
                            if writer.write_all(resp_json.as_bytes()).await.is_err() { break; }
                            if writer.write_all(b"\n").await.is_err() { break; }
                        }
                        Err(e) => {
                            debug!("Connection read failed: {}", e);
                            break;
                        }
                    }
                }
            });
        }
    }
}

// ── Request Handling ────────────────────────────────────────────────

async fn handle_request(raw: &str, state: &AppState) -> JsonRpcResponse {
    let req: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => return JsonRpcResponse::error(None, PARSE_ERROR, format!("Parse error: {}", e)),
    };
    debug!(method = %req.method, "Request");

    let params = req.params.unwrap_or(Value::Null);
    let id = req.id;

    match req.method.as_str() {
        "monitor.groups.list" => handle_list_groups(id, state),
        "monitor.groups.create" => with_params(id, params, |id, p: CreateGroupParams| handle_create_group(id, p, state)),
        "monitor.groups.update" => with_params(id, params, |id, p: UpdateGroupParams| handle_update_group(id, p, state)),
        "monitor.groups.delete" => with_params(id, params, |id, p: IdParams| handle_delete_group(id, p, state)),
        "monitor.keys.add" => with_params(id, params, |id, p: AddKeyParams| handle_add_key(id, p, state)),
        "monitor.keys.update" => with_params(id, params, |id, p: UpdateKeyParams| handle_update_key(id, p, state)),
        "monitor.keys.delete" => with_params(id, params, |id, p: IdParams| handle_delete_key(id, p, state)),
        "monitor.keys.details" => with_params(id, params, |id, p: IdParams| handle_key_details(id, p, state)),
        "monitor.usage.history" => with_params(id, params, |id, p: HistoryParams| handle_usage_history(id, p, state)),
        "monitor.usage.summary" => JsonRpcResponse::from_result(id, state.store.usage_summary(Utc::now())),
        "monitor.check.group" => match parse_params::<GroupIdParams>(params) {
            Ok(p) => handle_check_group(id, p, state).await,
            Err(msg) => JsonRpcResponse::error(id, INVALID_PARAMS, msg),
        },
        "monitor.check.all" => JsonRpcResponse::from_result(id, state.scheduler.check_all_now().await),
        "monitor.scheduler.status" => JsonRpcResponse::from_result(id, state.scheduler.status()),
        _ => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Unknown method: {}", req.method)),
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> std::result::Result<T, String> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| format!("Invalid params: {}", e))
}

fn with_params<T: DeserializeOwned>(
    id: Option<Value>,
    params: Value,
    handler: impl FnOnce(Option<Value>, T) -> JsonRpcResponse,
) -> JsonRpcResponse {
    match parse_params(params) {
        Ok(p) => handler(id, p),
        Err(msg) => JsonRpcResponse::error(id, INVALID_PARAMS, msg),
    }
}

#[derive(Debug, Deserialize)]
struct IdParams {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct GroupIdParams {
    group_id: i64,
}

// ── Groups ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateGroupParams {
    name: String,
    query_interval: Option<i64>,
    is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct UpdateGroupParams {
    id: i64,
    name: Option<String>,
    query_interval: Option<i64>,
    is_active: Option<bool>,
}

fn handle_list_groups(id: Option<Value>, state: &AppState) -> JsonRpcResponse {
    let result = (|| -> Result<Value> {
        let groups = state.store.list_groups()?;
        let credentials = state.store.list_credentials()?;
        let groups: Vec<Value> = groups
            .iter()
            .map(|g| {
                let keys = credentials.iter().filter(|c| c.group_id == g.id).count();
                json!({
                    "id": g.id,
                    "name": g.name,
                    "query_interval": g.query_interval,
                    "is_active": g.is_active,
                    "created_at": g.created_at,
                    "api_keys_count": keys,
                })
            })
            .collect();
        Ok(json!({ "groups": groups }))
    })();
    JsonRpcResponse::from_result(id, result)
}

fn handle_create_group(id: Option<Value>, p: CreateGroupParams, state: &AppState) -> JsonRpcResponse {
    let name = p.name.trim();
    if name.is_empty() {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "Group name must not be empty".into());
    }
    let interval = p.query_interval.unwrap_or(state.default_interval_secs);
    match state.store.create_group(name, interval, p.is_active.unwrap_or(true)) {
        Ok(group) => {
            state.scheduler.on_group_created(&group);
            info!(group_id = group.id, group = %group.name, interval_secs = group.query_interval, "Group created");
            JsonRpcResponse::success(id, json!({ "group_id": group.id }))
        }
        Err(e) => JsonRpcResponse::from_error(id, e),
    }
}

fn handle_update_group(id: Option<Value>, p: UpdateGroupParams, state: &AppState) -> JsonRpcResponse {
    if matches!(&p.name, Some(n) if n.trim().is_empty()) {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "Group name must not be empty".into());
    }
    let update = GroupUpdate {
        name: p.name.map(|n| n.trim().to_string()),
        query_interval: p.query_interval,
        is_active: p.is_active,
    };
    match state.store.update_group(p.id, update) {
        Ok(change) => {
            state.scheduler.on_group_changed(&change);
            JsonRpcResponse::from_result(id, Ok(json!({ "group": change.after })))
        }
        Err(e) => JsonRpcResponse::from_error(id, e),
    }
}

fn handle_delete_group(id: Option<Value>, p: IdParams, state: &AppState) -> JsonRpcResponse {
    match state.store.delete_group(p.id) {
        Ok(group) => {
            state.scheduler.on_group_deleted(group.id);
            info!(group_id = group.id, "Group deleted");
            JsonRpcResponse::success(id, json!({ "deleted": group.id }))
        }
        Err(e) => JsonRpcResponse::from_error(id, e),
    }
}

// ── Keys ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AddKeyParams {
    group_id: i64,
    api_key: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateKeyParams {
    id: i64,
    name: Option<String>,
    is_active: Option<bool>,
}

fn handle_add_key(id: Option<Value>, p: AddKeyParams, state: &AppState) -> JsonRpcResponse {
    let name = p.name.as_deref().map(str::trim).filter(|n| !n.is_empty());
    match state.store.add_credential(p.group_id, &p.api_key, name) {
        Ok(cred) => {
            info!(key_id = cred.id, group_id = cred.group_id, api_type = cred.api_type.as_str(), "API key added");
            JsonRpcResponse::success(
                id,
                json!({ "key_id": cred.id, "name": cred.name, "api_type": cred.api_type }),
            )
        }
        Err(e) => JsonRpcResponse::from_error(id, e),
    }
}

fn handle_update_key(id: Option<Value>, p: UpdateKeyParams, state: &AppState) -> JsonRpcResponse {
    let result = state
        .store
        .update_credential(p.id, p.name.as_deref(), p.is_active)
        .and_then(|cred| state.store.credential_view(cred.id, false, Utc::now()));
    JsonRpcResponse::from_result(id, result.map(|view| json!({ "key": view })))
}

fn handle_delete_key(id: Option<Value>, p: IdParams, state: &AppState) -> JsonRpcResponse {
    match state.store.delete_credential(p.id) {
        Ok(true) => JsonRpcResponse::success(id, json!({ "deleted": p.id })),
        Ok(false) => JsonRpcResponse::from_error(id, StoreError::CredentialNotFound(p.id).into()),
        Err(e) => JsonRpcResponse::from_error(id, e),
    }
}

fn handle_key_details(id: Option<Value>, p: IdParams, state: &AppState) -> JsonRpcResponse {
    match state.store.credential_view(p.id, true, Utc::now()) {
        Ok(Some(view)) => JsonRpcResponse::from_result(id, Ok(view)),
        Ok(None) => JsonRpcResponse::from_error(id, StoreError::CredentialNotFound(p.id).into()),
        Err(e) => JsonRpcResponse::from_error(id, e),
    }
}

// ── Usage ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct HistoryParams {
    key_id: i64,
    #[serde(default = "default_history_hours")]
    hours: i64,
    #[serde(default)]
    period: HistoryPeriod,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
enum HistoryPeriod {
    #[default]
    Hour,
    Day,
}

fn default_history_hours() -> i64 {
    24
}

fn handle_usage_history(id: Option<Value>, p: HistoryParams, state: &AppState) -> JsonRpcResponse {
    if p.hours <= 0 {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "hours must be positive".into());
    }
    let since = TimeDelta::try_hours(p.hours).and_then(|window| Utc::now().checked_sub_signed(window));
    let Some(since) = since else {
        return JsonRpcResponse::error(id, INVALID_PARAMS, format!("hours {} is out of range", p.hours));
    };
    let result = state.store.get_credential(p.key_id).and_then(|cred| {
        if cred.is_none() {
            return Err(StoreError::CredentialNotFound(p.key_id).into());
        }
        let records = state.store.usage_history(p.key_id, since)?;
        Ok(match p.period {
            HistoryPeriod::Day => json!({ "days": daily_rollup(&records) }),
            HistoryPeriod::Hour => {
                let views: Vec<RecordView> = records.into_iter().map(RecordView::from).collect();
                json!({ "records": views })
            }
        })
    });
    JsonRpcResponse::from_result(id, result)
}

// ── Checks ──────────────────────────────────────────────────────────

async fn handle_check_group(id: Option<Value>, p: GroupIdParams, state: &AppState) -> JsonRpcResponse {
    match state.store.get_group(p.group_id) {
        Ok(Some(_)) => {}
        Ok(None) => return JsonRpcResponse::from_error(id, StoreError::GroupNotFound(p.group_id).into()),
        Err(e) => return JsonRpcResponse::from_error(id, e),
    }
    match state.scheduler.check_group_now(p.group_id).await {
        Ok(run) => JsonRpcResponse::from_result(id, Ok(run)),
        Err(e) => {
            warn!(group_id = p.group_id, "On-demand check failed: {}", e);
            JsonRpcResponse::error(id, OPERATION_FAILED, e.to_string())
        }
    }
}
