use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use azure_openai_proxy::config::{InstanceConfig, ProviderType, RoutingStrategy};
use azure_openai_proxy::{AppState, Dispatcher, InstanceManager, MemoryStore};

pub struct TestProxy {
    pub app: Router,
    pub manager: Arc<InstanceManager>,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn instance_config(name: &str, api_base: &str) -> InstanceConfig {
    let mut deployments = HashMap::new();
    deployments.insert("gpt-4".to_string(), format!("{name}-dep"));

    InstanceConfig {
        name: name.to_string(),
        provider_type: ProviderType::Azure,
        api_key: "sk-test".to_string(),
        api_base: api_base.to_string(),
        api_version: "2024-05-01-preview".to_string(),
        proxy_url: None,
        priority: 0,
        weight: 1,
        max_tpm: 60_000,
        max_input_tokens: 0,
        supported_models: vec!["gpt-4".to_string()],
        model_deployments: deployments,
        enabled: true,
        timeout_seconds: 30.0,
        retry_count: 0,
        rate_limit_enabled: true,
    }
}

pub fn build_proxy(instances: Vec<InstanceConfig>, strategy: RoutingStrategy) -> TestProxy {
    build_proxy_with_admin_token(instances, strategy, None)
}

pub fn build_proxy_with_admin_token(
    instances: Vec<InstanceConfig>,
    strategy: RoutingStrategy,
    admin_token: Option<&str>,
) -> TestProxy {
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(InstanceManager::new(
        instances.clone(),
        strategy,
        store.clone(),
        store,
    ));
    let dispatcher =
        Arc::new(Dispatcher::new(manager.clone(), &instances).expect("dispatcher"));

    let mut state = AppState::new(manager.clone(), dispatcher.clone());
    if let Some(token) = admin_token {
        state = state.with_admin_token(token);
    }

    TestProxy {
        app: azure_openai_proxy::router(state),
        manager,
        dispatcher,
    }
}

pub async fn post_json(app: &Router, path: &str, body: Value) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn get(app: &Router, path: &str) -> Response<Body> {
    let request = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn response_json(response: Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}
