//! Administrative surface: readiness, instance listing and detail,
//! runtime reconfiguration, reset, and the sanitised config dump.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};

use super::{require_admin, AppState};

/// Readiness: healthy / degraded / unhealthy from the healthy-instance
/// ratio; unhealthy responds 503.
pub async fn health(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }

    let stats = match state.manager.fleet_stats().await {
        Ok(stats) => stats,
        Err(err) => {
            tracing::error!(error = %err, "failed to compute fleet health");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "error": "failed to retrieve health information",
                })),
            )
                .into_response();
        }
    };

    let status = if stats.healthy_instances == 0 {
        "unhealthy"
    } else if stats.healthy_instances < stats.total_instances / 2 {
        "degraded"
    } else {
        "healthy"
    };
    let status_code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status_code,
        Json(json!({
            "status": status,
            "instances": {
                "total": stats.total_instances,
                "healthy": stats.healthy_instances,
                "unhealthy": stats.total_instances - stats.healthy_instances,
            },
            "uptime": {"status": "running"},
        })),
    )
        .into_response()
}

pub async fn list_instances(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }

    match state.manager.fleet_stats().await {
        Ok(stats) => Json(json!({
            "instances": stats.instances,
            "summary": {
                "total_instances": stats.total_instances,
                "healthy_instances": stats.healthy_instances,
                "total_requests": stats.total_requests,
                "total_tokens": stats.total_tokens,
            },
        }))
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to list instances");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to retrieve instance information"})),
            )
                .into_response()
        }
    }
}

pub async fn get_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }

    let Some(config) = state.manager.instance_config(&name).await else {
        return instance_not_found(&name);
    };

    let state_snapshot = match state.manager.instance_state(&name).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::error!(instance = %name, error = %err, "failed to load instance state");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to retrieve instance state"})),
            )
                .into_response();
        }
    };

    let state_value = serde_json::to_value(&state_snapshot).unwrap_or(Value::Null);
    Json(json!({
        "name": name,
        "config": sanitize_config_value(&config),
        "state": state_value,
        "health": {
            "status": state_snapshot.status,
            "health_status": state_snapshot.health_status,
            "connection_status": state_snapshot.connection_status,
            "last_error": state_snapshot.last_error,
            "last_error_time": state_snapshot.last_error_time,
            "avg_latency_ms": state_snapshot.avg_latency_ms,
        },
        "usage": {
            "current_tpm": state_snapshot.current_tpm,
            "current_rpm": state_snapshot.current_rpm,
            "total_requests": state_snapshot.total_requests,
            "successful_requests": state_snapshot.successful_requests,
            "total_tokens_served": state_snapshot.total_tokens_served,
            "utilization_percent": state_snapshot.utilization_percentage,
            "last_used": state_snapshot.last_used,
        },
        "errors": {
            "total_errors": state_snapshot.error_count,
            "errors_500": state_snapshot.total_errors_500,
            "errors_503": state_snapshot.total_errors_503,
            "other_errors": state_snapshot.total_other_errors,
            "current_error_rate": state_snapshot.current_error_rate,
        },
    }))
    .into_response()
}

pub async fn reset_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }

    if state.manager.instance_config(&name).await.is_none() {
        return instance_not_found(&name);
    }

    match state.manager.reset_instance(&name).await {
        Ok(()) => {
            tracing::info!(instance = %name, "instance reset");
            Json(json!({
                "message": "instance reset successfully",
                "instance": name,
            }))
            .into_response()
        }
        Err(err) => {
            tracing::error!(instance = %name, error = %err.message, "failed to reset instance");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to reset instance", "details": err.message})),
            )
                .into_response()
        }
    }
}

pub async fn update_instance_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }

    let updates: Map<String, Value> = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(updates)) => updates,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid JSON payload"})),
            )
                .into_response()
        }
    };

    match state.manager.update_instance_config(&name, &updates).await {
        Ok(_) => {
            tracing::info!(instance = %name, "instance configuration updated");
            Json(json!({
                "message": "instance configuration updated successfully",
                "instance": name,
                "updated_fields": updates,
            }))
            .into_response()
        }
        Err(err) => {
            let status = StatusCode::from_u16(err.status_code)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let mut body = json!({"error": err.message});
            if let Some(allowed) = err.details.get("allowed_fields") {
                body["allowed_fields"] = allowed.clone();
            }
            (status, Json(body)).into_response()
        }
    }
}

/// Full configuration with secrets replaced by presence booleans.
pub async fn get_config(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }

    let configs = state.manager.all_configs().await;
    let sanitized: Vec<Value> = configs.iter().map(sanitize_config_value).collect();

    Json(json!({
        "instances": sanitized,
        "total_instances": configs.len(),
    }))
    .into_response()
}

fn sanitize_config_value(config: &crate::config::InstanceConfig) -> Value {
    json!({
        "name": config.name,
        "provider_type": config.provider_type,
        "api_base": config.api_base,
        "api_version": config.api_version,
        "proxy_url": config.proxy_url,
        "priority": config.priority,
        "weight": config.weight,
        "max_tpm": config.max_tpm,
        "max_input_tokens": config.max_input_tokens,
        "supported_models": config.supported_models,
        "model_deployments": config.model_deployments,
        "enabled": config.enabled,
        "timeout_seconds": config.timeout_seconds,
        "retry_count": config.retry_count,
        "rate_limit_enabled": config.rate_limit_enabled,
        "api_key_configured": !config.api_key.is_empty(),
    })
}

fn instance_not_found(name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "instance not found", "instance": name})),
    )
        .into_response()
}
