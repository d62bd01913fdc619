mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use httpmock::prelude::*;
use serde_json::json;
use tower::ServiceExt;

use azure_openai_proxy::config::RoutingStrategy;
use common::{
    build_proxy, build_proxy_with_admin_token, get, instance_config, post_json, response_json,
};

#[tokio::test]
async fn liveness_is_always_healthy() {
    let proxy = build_proxy(
        vec![instance_config("azure-east", "http://127.0.0.1:1")],
        RoutingStrategy::Failover,
    );
    let (status, body) = response_json(get(&proxy.app, "/health").await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "healthy"}));
}

#[tokio::test]
async fn readiness_reports_healthy_and_unhealthy_fleets() {
    let proxy = build_proxy(
        vec![instance_config("azure-east", "http://127.0.0.1:1")],
        RoutingStrategy::Failover,
    );
    let (status, body) = response_json(get(&proxy.app, "/admin/health").await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));
    assert_eq!(body["instances"]["total"], json!(1));

    // Demote the only instance; readiness flips to unhealthy with 503.
    for _ in 0..11 {
        proxy
            .manager
            .record_error(
                "azure-east",
                500,
                azure_openai_proxy::ErrorOrigin::Upstream,
                "boom",
                0,
            )
            .await;
    }
    let (status, body) = response_json(get(&proxy.app, "/admin/health").await).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], json!("unhealthy"));
}

#[tokio::test]
async fn admin_routes_require_matching_token_when_configured() {
    let proxy = build_proxy_with_admin_token(
        vec![instance_config("azure-east", "http://127.0.0.1:1")],
        RoutingStrategy::Failover,
        Some("s3cret"),
    );

    let (status, _) = response_json(get(&proxy.app, "/admin/instances").await).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("GET")
        .uri("/admin/instances")
        .header("X-Admin-Token", "wrong")
        .body(Body::empty())
        .unwrap();
    let response = proxy.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("GET")
        .uri("/admin/instances")
        .header("X-Admin-Token", "s3cret")
        .body(Body::empty())
        .unwrap();
    let response = proxy.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The unauthenticated proxy surface is not gated.
    let (status, _) = response_json(get(&proxy.app, "/health").await).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn instance_detail_includes_config_state_and_error_sections() {
    let proxy = build_proxy(
        vec![instance_config("azure-east", "http://127.0.0.1:1")],
        RoutingStrategy::Failover,
    );
    proxy.manager.record_success("azure-east", 120, 42.0).await;

    let (status, body) = response_json(get(&proxy.app, "/admin/instances/azure-east").await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], json!("azure-east"));
    assert_eq!(body["usage"]["total_requests"], json!(1));
    assert_eq!(body["usage"]["total_tokens_served"], json!(120));
    assert_eq!(body["config"]["api_key_configured"], json!(true));
    assert!(body["config"].get("api_key").is_none());

    let (status, _) = response_json(get(&proxy.app, "/admin/instances/nope").await).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reset_clears_state_and_rate_limit_window() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST)
            .path("/openai/deployments/azure-east-dep/chat/completions");
        then.status(200).json_body(json!({"id": "ok"}));
    });

    let proxy = build_proxy(
        vec![instance_config("azure-east", &upstream.base_url())],
        RoutingStrategy::Failover,
    );
    let payload = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]});
    post_json(&proxy.app, "/v1/chat/completions", payload).await;

    let state = proxy.manager.instance_state("azure-east").await.unwrap();
    assert_eq!(state.total_requests, 1);

    let response = post_json(&proxy.app, "/admin/instances/azure-east/reset", json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);

    let state = proxy.manager.instance_state("azure-east").await.unwrap();
    assert_eq!(state.total_requests, 0);
    let stats = proxy
        .manager
        .rate_limiter("azure-east")
        .await
        .unwrap()
        .usage_stats()
        .await
        .unwrap();
    assert_eq!(stats.total_tokens, 0);

    // Resetting an already-clean instance succeeds and changes nothing.
    let response = post_json(&proxy.app, "/admin/instances/azure-east/reset", json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = post_json(&proxy.app, "/admin/instances/nope/reset", json!({})).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn config_updates_honour_the_allow_list() {
    let proxy = build_proxy(
        vec![instance_config("azure-east", "http://127.0.0.1:1")],
        RoutingStrategy::Failover,
    );

    let request = Request::builder()
        .method("PUT")
        .uri("/admin/instances/azure-east/config")
        .header("content-type", "application/json")
        .body(Body::from(json!({"api_key": "stolen"}).to_string()))
        .unwrap();
    let response = proxy.app.clone().oneshot(request).await.unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["allowed_fields"].is_array());

    let request = Request::builder()
        .method("PUT")
        .uri("/admin/instances/azure-east/config")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"weight": 5, "max_tpm": 1000, "enabled": false}).to_string(),
        ))
        .unwrap();
    let response = proxy.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let config = proxy
        .manager
        .instance_config("azure-east")
        .await
        .unwrap();
    assert_eq!(config.weight, 5);
    assert_eq!(config.max_tpm, 1000);
    assert!(!config.enabled);
}

#[tokio::test]
async fn config_dump_is_sanitised() {
    let proxy = build_proxy(
        vec![instance_config("azure-east", "http://127.0.0.1:1")],
        RoutingStrategy::Failover,
    );

    let (status, body) = response_json(get(&proxy.app, "/admin/config").await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_instances"], json!(1));
    let instance = &body["instances"][0];
    assert_eq!(instance["api_key_configured"], json!(true));
    assert!(instance.get("api_key").is_none());
    assert_eq!(instance["name"], json!("azure-east"));
}
