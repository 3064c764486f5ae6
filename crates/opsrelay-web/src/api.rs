use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use opsrelay_core::RegistryError;

use crate::auth::{self, SessionUser};
use crate::{AppState, stream_path};

const ADMIN_USER_ID: u64 = 1;
const SESSION_TTL_MS: u64 = 24 * 60 * 60 * 1000;

type ApiResult = Result<Json<Value>, (StatusCode, String)>;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct SshTargetRequest {
    pub host: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct ForceQuery {
    pub force: Option<String>,
}

/// POST /api/auth/login
pub async fn login(State(state): State<Arc<AppState>>, Json(body): Json<LoginRequest>) -> ApiResult {
    if !auth::check_credentials(&state.admin, &body.username, &body.password) {
        return Err((StatusCode::UNAUTHORIZED, "invalid credentials".to_string()));
    }
    let token = state
        .tokens
        .issue(ADMIN_USER_ID, &body.username, SESSION_TTL_MS)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    info!(username = %body.username, "operator logged in");
    Ok(Json(json!({
        "token": token,
        "user": SessionUser {
            id: ADMIN_USER_ID,
            username: body.username,
            name: "Administrator".to_string(),
        },
    })))
}

/// GET /api/auth/session
pub async fn session(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let user = auth::require_auth(&state.tokens, &headers)?;
    Ok(Json(serde_json::to_value(user).expect("user serializes")))
}

/// POST /api/auth/logout. Tokens are stateless; the client drops its copy.
pub async fn logout() -> Json<Value> {
    Json(json!({"success": true}))
}

/// GET /api/commands. Public catalog, no auth required.
pub async fn list_commands(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({"ok": true, "commands": state.registry.catalog()}))
}

/// POST /api/commands/{key}
pub async fn start_command(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> ApiResult {
    auth::require_auth(&state.tokens, &headers)?;
    let instance = state.registry.start(&key).map_err(|err| match err {
        RegistryError::TooManyRunning(_) => (StatusCode::TOO_MANY_REQUESTS, err.to_string()),
        RegistryError::UnknownCommand(_) | RegistryError::Exec(_) => {
            (StatusCode::BAD_REQUEST, err.to_string())
        }
    })?;
    Ok(Json(json!({
        "ok": true,
        "command": instance.snapshot(),
        "streamPath": stream_path(&instance.id),
    })))
}

/// GET /api/commands/{id}
pub async fn command_info(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    auth::require_auth(&state.tokens, &headers)?;
    let instance = state
        .registry
        .get(&id)
        .ok_or((StatusCode::NOT_FOUND, "not found".to_string()))?;
    Ok(Json(json!({"ok": true, "command": instance.snapshot()})))
}

/// DELETE /api/commands/{id}
pub async fn cancel_command(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    auth::require_auth(&state.tokens, &headers)?;
    if state.registry.get(&id).is_none() {
        return Err((StatusCode::NOT_FOUND, "not found".to_string()));
    }
    Ok(Json(json!({"ok": state.registry.cancel(&id)})))
}

/// GET /api/settings/ssh
pub async fn ssh_settings(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    auth::require_auth(&state.tokens, &headers)?;
    Ok(Json(json!({"ok": true, "settings": state.settings.public_view()})))
}

/// POST /api/settings/ssh
pub async fn save_ssh_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SshTargetRequest>,
) -> ApiResult {
    auth::require_auth(&state.tokens, &headers)?;
    state
        .settings
        .save_host_user(&body.host, &body.username)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(json!({"ok": true})))
}

/// POST /api/settings/ssh/key?force=1
pub async fn generate_ssh_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ForceQuery>,
) -> ApiResult {
    auth::require_auth(&state.tokens, &headers)?;
    let force = query.force.as_deref() == Some("1");
    let (public_key, replaced) = state
        .settings
        .generate_keypair(&state.vault, force)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(json!({"ok": true, "publicKey": public_key, "replaced": replaced})))
}

/// POST /api/settings/ssh/test
pub async fn test_ssh(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    auth::require_auth(&state.tokens, &headers)?;
    let outcome = state.ssh.test_connection().await;
    Ok(Json(json!({
        "ok": true,
        "success": outcome.success,
        "message": outcome.message,
        "latencyMs": outcome.latency_ms,
    })))
}
