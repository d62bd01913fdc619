//! Client-facing HTTP surface: proxy endpoints, liveness, admin, stats.

pub mod admin;
pub mod proxy;
pub mod stats;

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;

use crate::dispatch::Dispatcher;
use crate::error::ProxyError;
use crate::manager::InstanceManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<InstanceManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(manager: Arc<InstanceManager>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            manager,
            dispatcher,
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(proxy::chat_completions))
        .route("/v1/completions", post(proxy::completions))
        .route("/v1/embeddings", post(proxy::embeddings))
        .route("/admin/health", get(admin::health))
        .route("/admin/instances", get(admin::list_instances))
        .route("/admin/instances/:name", get(admin::get_instance))
        .route("/admin/instances/:name/reset", post(admin::reset_instance))
        .route(
            "/admin/instances/:name/config",
            put(admin::update_instance_config),
        )
        .route("/admin/config", get(admin::get_config))
        .route("/stats", get(stats::overall))
        .route("/stats/", get(stats::overall))
        .route("/stats/instances", get(stats::instances))
        .route("/stats/usage", get(stats::usage))
        .with_state(state)
}

/// Liveness: always healthy while the process is serving.
async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}

/// Client-facing error envelope, with `Retry-After` when the error carries
/// a positive hint.
pub(crate) fn error_response(err: &ProxyError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "error": {
            "message": err.message,
            "type": err.kind.as_str(),
            "code": err.status_code,
        }
    });

    let mut response = (status, Json(body)).into_response();
    let retry_after = err.retry_after();
    if retry_after > 0 {
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert("Retry-After", value);
        }
    }
    response
}

/// Gate for `/admin/*`: enforced only when an admin token is configured.
pub(crate) fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Ok(());
    };

    let provided = headers
        .get("X-Admin-Token")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if provided == expected {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "admin token required"})),
        )
            .into_response())
    }
}
