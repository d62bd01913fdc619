//! Statistics surface: fleet aggregates, per-instance snapshots, and the
//! usage time series read from the longer-horizon usage log.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use super::AppState;
use crate::error::unix_now;
use crate::state::InstanceState;

const VALID_METRICS: [&str; 4] = ["tokens", "requests", "errors", "latency"];

pub async fn overall(State(state): State<AppState>) -> Response {
    let stats = match state.manager.fleet_stats().await {
        Ok(stats) => stats,
        Err(err) => {
            tracing::error!(error = %err, "failed to compute overall stats");
            return stats_unavailable();
        }
    };

    let health_percentage = if stats.total_instances > 0 {
        stats.healthy_instances as f64 / stats.total_instances as f64 * 100.0
    } else {
        0.0
    };
    let avg_tokens_per_request = if stats.total_requests > 0 {
        stats.total_tokens as f64 / stats.total_requests as f64
    } else {
        0.0
    };

    Json(json!({
        "summary": {
            "total_instances": stats.total_instances,
            "healthy_instances": stats.healthy_instances,
            "unhealthy_instances": stats.total_instances - stats.healthy_instances,
            "health_percentage": health_percentage,
            "total_requests": stats.total_requests,
            "total_tokens_served": stats.total_tokens,
            "avg_tokens_per_request": avg_tokens_per_request,
        },
        "instances": stats.instances,
        "timestamp": unix_now(),
    }))
    .into_response()
}

pub async fn instances(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(window_minutes) = positive_param(&params, "window", 60) else {
        return bad_request("invalid window parameter, must be positive integer (minutes)");
    };

    let now = unix_now();
    let window_start = now - (window_minutes as i64) * 60;

    match params.get("instance").filter(|name| !name.is_empty()) {
        Some(name) => {
            if state.manager.instance_config(name).await.is_none() {
                return instance_not_found(name);
            }
            let snapshot = match state.manager.instance_state(name).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::error!(instance = %name, error = %err, "failed to load state");
                    return stats_unavailable();
                }
            };

            Json(json!({
                "instance": name,
                "window_minutes": window_minutes,
                "window_start": window_start,
                "window_end": now,
                "current_status": {
                    "status": snapshot.status,
                    "health_status": snapshot.health_status,
                    "connection_status": snapshot.connection_status,
                    "last_used": snapshot.last_used,
                    "avg_latency_ms": snapshot.avg_latency_ms,
                    "utilization_percent": snapshot.utilization_percentage,
                },
                "usage": {
                    "current_tpm": snapshot.current_tpm,
                    "current_rpm": snapshot.current_rpm,
                    "total_requests": snapshot.total_requests,
                    "successful_requests": snapshot.successful_requests,
                    "total_tokens_served": snapshot.total_tokens_served,
                },
                "errors": {
                    "total_errors": snapshot.error_count,
                    "error_rate_percent": snapshot.current_error_rate,
                    "errors_500": snapshot.total_errors_500,
                    "errors_503": snapshot.total_errors_503,
                    "other_errors": snapshot.total_other_errors,
                    "client_errors_500": snapshot.total_client_errors_500,
                    "client_errors_503": snapshot.total_client_errors_503,
                    "upstream_errors_429": snapshot.total_upstream_429_errors,
                    "upstream_errors_400": snapshot.total_upstream_400_errors,
                    "upstream_errors_500": snapshot.total_upstream_500_errors,
                },
                "rate_limiting": {
                    "rate_limited_until": snapshot.rate_limited_until,
                },
            }))
            .into_response()
        }
        None => match state.manager.fleet_stats().await {
            Ok(stats) => Json(json!({
                "window_minutes": window_minutes,
                "window_start": window_start,
                "window_end": now,
                "summary": {
                    "total_instances": stats.total_instances,
                    "healthy_instances": stats.healthy_instances,
                    "total_requests": stats.total_requests,
                    "total_tokens": stats.total_tokens,
                },
                "instances": stats.instances,
            }))
            .into_response(),
            Err(err) => {
                tracing::error!(error = %err, "failed to compute instance stats");
                stats_unavailable()
            }
        },
    }
}

/// Time-series usage. Token and request series come from the durable usage
/// log; error series from the 60s state windows; latency reports the
/// current EMA snapshot.
pub async fn usage(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let metric = params
        .get("metric")
        .cloned()
        .unwrap_or_else(|| "tokens".to_string());
    if !VALID_METRICS.contains(&metric.as_str()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid metric type",
                "valid_metrics": VALID_METRICS,
            })),
        )
            .into_response();
    }

    let Some(window_minutes) = positive_param(&params, "window", 60) else {
        return bad_request("invalid window parameter");
    };
    let Some(granularity_minutes) = positive_param(&params, "granularity", 5) else {
        return bad_request("invalid granularity parameter");
    };

    let now = unix_now();
    let window_start = now - (window_minutes as i64) * 60;

    match params.get("instance").filter(|name| !name.is_empty()) {
        Some(name) => {
            if state.manager.instance_config(name).await.is_none() {
                return instance_not_found(name);
            }
            let snapshot = match state.manager.instance_state(name).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::error!(instance = %name, error = %err, "failed to load state");
                    return stats_unavailable();
                }
            };

            let series = instance_series(
                &state,
                name,
                &metric,
                &snapshot,
                window_start,
                now,
                granularity_minutes,
            )
            .await;

            Json(json!({
                "instance": name,
                "metric": metric,
                "window_minutes": window_minutes,
                "granularity_minutes": granularity_minutes,
                "window_start": window_start,
                "window_end": now,
                "current_value": current_metric_value(&metric, &snapshot),
                "time_series": series,
            }))
            .into_response()
        }
        None => {
            let configs = state.manager.all_configs().await;
            let mut merged: Vec<Value> = Vec::new();
            let mut current_total = 0.0;
            let mut snapshots = Vec::new();
            for config in &configs {
                if let Ok(snapshot) = state.manager.instance_state(&config.name).await {
                    let series = instance_series(
                        &state,
                        &config.name,
                        &metric,
                        &snapshot,
                        window_start,
                        now,
                        granularity_minutes,
                    )
                    .await;
                    merged = merge_series(merged, series);
                    current_total += current_metric_value(&metric, &snapshot);
                    snapshots.push(snapshot);
                }
            }
            if metric == "latency" && !snapshots.is_empty() {
                current_total /= snapshots.len() as f64;
            }

            Json(json!({
                "metric": metric,
                "window_minutes": window_minutes,
                "granularity_minutes": granularity_minutes,
                "window_start": window_start,
                "window_end": now,
                "instances_count": configs.len(),
                "current_value": current_total,
                "time_series": merged,
            }))
            .into_response()
        }
    }
}

async fn instance_series(
    state: &AppState,
    name: &str,
    metric: &str,
    snapshot: &InstanceState,
    window_start: i64,
    window_end: i64,
    granularity_minutes: u64,
) -> Vec<Value> {
    let step = (granularity_minutes as i64) * 60;
    let mut buckets: Vec<(i64, f64)> = Vec::new();
    let mut ts = window_start;
    while ts < window_end {
        buckets.push((ts, 0.0));
        ts += step;
    }

    match metric {
        "tokens" | "requests" => {
            let samples = state
                .manager
                .usage_samples(name, window_end - window_start)
                .await
                .unwrap_or_default();
            for (sample_ts, tokens) in samples {
                let Some(index) = bucket_index(sample_ts, window_start, step, buckets.len()) else {
                    continue;
                };
                buckets[index].1 += if metric == "tokens" { tokens as f64 } else { 1.0 };
            }
        }
        "errors" => {
            // Only the last minute of error history is retained in state.
            for window in [
                &snapshot.error_500_window,
                &snapshot.error_503_window,
                &snapshot.error_other_window,
            ] {
                for (sample_ts, count) in window {
                    let Some(index) =
                        bucket_index(*sample_ts, window_start, step, buckets.len())
                    else {
                        continue;
                    };
                    buckets[index].1 += *count as f64;
                }
            }
        }
        _ => {
            // Latency has no stored history; report the observed EMA.
            let value = snapshot.avg_latency_ms.unwrap_or(0.0);
            for bucket in &mut buckets {
                bucket.1 = value;
            }
        }
    }

    buckets
        .into_iter()
        .map(|(timestamp, value)| json!({"timestamp": timestamp, "value": value}))
        .collect()
}

fn bucket_index(ts: i64, window_start: i64, step: i64, len: usize) -> Option<usize> {
    if ts < window_start || step <= 0 || len == 0 {
        return None;
    }
    // A sample stamped exactly at the window end belongs to the last bucket.
    let index = ((ts - window_start) / step) as usize;
    Some(index.min(len - 1))
}

fn merge_series(base: Vec<Value>, other: Vec<Value>) -> Vec<Value> {
    if base.is_empty() {
        return other;
    }
    base.into_iter()
        .zip(other)
        .map(|(left, right)| {
            let timestamp = left["timestamp"].clone();
            let sum = left["value"].as_f64().unwrap_or(0.0) + right["value"].as_f64().unwrap_or(0.0);
            json!({"timestamp": timestamp, "value": sum})
        })
        .collect()
}

fn current_metric_value(metric: &str, snapshot: &InstanceState) -> f64 {
    match metric {
        "tokens" => snapshot.current_tpm as f64,
        "requests" => snapshot.current_rpm as f64,
        "errors" => snapshot.current_error_rate,
        _ => snapshot.avg_latency_ms.unwrap_or(0.0),
    }
}

fn positive_param(params: &HashMap<String, String>, key: &str, default: u64) -> Option<u64> {
    match params.get(key) {
        Some(raw) => raw.parse::<u64>().ok().filter(|value| *value > 0),
        None => Some(default),
    }
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

fn instance_not_found(name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "instance not found", "instance": name})),
    )
        .into_response()
}

fn stats_unavailable() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "failed to retrieve statistics"})),
    )
        .into_response()
}
