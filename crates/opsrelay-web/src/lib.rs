use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use opsrelay_core::registry::CommandRegistry;
use opsrelay_crypto::{TokenCodec, Vault};
use opsrelay_ssh::{SettingsStore, SshExecutor};

pub mod api;
pub mod auth;
pub mod ws;

pub use auth::AdminCredentials;

/// Shared application state behind every handler.
pub struct AppState {
    pub registry: Arc<CommandRegistry>,
    pub settings: Arc<SettingsStore>,
    pub vault: Arc<Vault>,
    pub tokens: Arc<TokenCodec>,
    pub admin: AdminCredentials,
    pub ssh: Arc<SshExecutor>,
}

/// Stream path for one instance, as returned to start callers.
pub fn stream_path(id: &str) -> String {
    format!("/api/ws/command/{id}")
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/auth/login", post(api::login))
        .route("/api/auth/session", get(api::session))
        .route("/api/auth/logout", post(api::logout))
        .route("/api/commands", get(api::list_commands))
        .route(
            "/api/commands/{id}",
            post(api::start_command)
                .get(api::command_info)
                .delete(api::cancel_command),
        )
        .route(
            "/api/settings/ssh",
            get(api::ssh_settings).post(api::save_ssh_settings),
        )
        .route("/api/settings/ssh/key", post(api::generate_ssh_key))
        .route("/api/settings/ssh/test", post(api::test_ssh))
        .route("/api/ws/command/{id}", get(ws::command_stream))
        .with_state(state)
}

pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid --allow-origin value: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any))
}
