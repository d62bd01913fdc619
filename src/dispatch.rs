//! End-to-end request flow: validate, select, transform, admit, forward,
//! account. Composes the selector, transformer, rate limiter, and upstream
//! clients around the shared instance state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderMap;
use bytes::Bytes;
use serde_json::Value;

use crate::config::{InstanceConfig, ProviderType};
use crate::error::ProxyError;
use crate::manager::InstanceManager;
use crate::state::ErrorOrigin;
use crate::transform::{
    resolve_deployment, strip_internal_metadata, ProxyEndpoint, RequestTransformer,
};
use crate::upstream::{parse_error_response, AzureClient};

/// What the HTTP layer turns into the client-facing response.
pub enum DispatchReply {
    /// Rewritten JSON body with the upstream status and headers.
    Json {
        status: u16,
        headers: HeaderMap,
        body: Value,
    },
    /// Upstream body that did not parse as JSON; forwarded untouched.
    Raw {
        status: u16,
        headers: HeaderMap,
        body: Bytes,
    },
    /// Streaming response to be relayed chunk by chunk.
    Stream {
        status: u16,
        headers: HeaderMap,
        upstream: reqwest::Response,
        original_model: String,
    },
}

pub struct Dispatcher {
    manager: Arc<InstanceManager>,
    transformer: RequestTransformer,
    clients: HashMap<String, Arc<AzureClient>>,
}

impl Dispatcher {
    /// Builds one upstream client per Azure instance up front; they carry
    /// their own connection pools and are safe to share across requests.
    pub fn new(
        manager: Arc<InstanceManager>,
        instances: &[InstanceConfig],
    ) -> Result<Self, ProxyError> {
        let mut clients = HashMap::new();
        for instance in instances {
            if instance.provider_type == ProviderType::Azure {
                clients.insert(
                    instance.name.clone(),
                    Arc::new(AzureClient::new(instance.clone())?),
                );
            }
        }
        Ok(Self {
            manager,
            transformer: RequestTransformer::new(),
            clients,
        })
    }

    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    pub fn client(&self, name: &str) -> Option<Arc<AzureClient>> {
        self.clients.get(name).cloned()
    }

    pub async fn dispatch(
        &self,
        endpoint: ProxyEndpoint,
        payload: Value,
    ) -> Result<DispatchReply, ProxyError> {
        let started = Instant::now();

        let Some(payload) = payload.as_object() else {
            return Err(ProxyError::client("invalid JSON payload", 400));
        };

        self.transformer.validate(endpoint, payload)?;

        let model = payload
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let selected = self
            .manager
            .select_instance(&model, 0, Some(ProviderType::Azure))
            .await
            .map_err(|err| {
                ProxyError::instance("no suitable instance available")
                    .with_detail("model", model.clone())
                    .with_detail("endpoint", endpoint.path())
                    .with_detail("error", err.message)
            })?;

        let config = self
            .manager
            .instance_config(&selected)
            .await
            .ok_or_else(|| {
                ProxyError::internal("failed to get instance config")
                    .with_detail("instance", selected.clone())
            })?;

        let deployment = resolve_deployment(&model, &config.model_deployments);
        let transformed = self.transformer.transform_to_azure(endpoint, payload)?;

        let (admitted, retry_after) = self
            .manager
            .check_rate_limit(&selected, transformed.required_tokens)
            .await;
        if !admitted {
            return Err(ProxyError::upstream("rate limit exceeded", 429)
                .with_detail("instance", selected.clone())
                .with_detail("tokens", transformed.required_tokens)
                .with_retry_after(retry_after));
        }

        let is_streaming = payload
            .get("stream")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let clean_payload = strip_internal_metadata(&transformed.payload);

        let client = self.client(&selected).ok_or_else(|| {
            ProxyError::internal("Azure service not found for instance")
                .with_detail("instance", selected.clone())
        })?;

        tracing::debug!(
            instance = %selected,
            model = %transformed.original_model,
            deployment = %deployment,
            tokens = transformed.required_tokens,
            streaming = is_streaming,
            "forwarding request"
        );

        let response = if is_streaming {
            client
                .stream_request(endpoint, clean_payload, &deployment)
                .await?
        } else {
            client
                .proxy_request(endpoint, &clean_payload, &deployment)
                .await?
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        if status >= 400 {
            let err = parse_error_response(response).await;
            self.manager
                .record_error(
                    &selected,
                    status,
                    ErrorOrigin::Upstream,
                    &err.message,
                    err.retry_after(),
                )
                .await;
            return Err(err);
        }

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.manager
            .record_success(&selected, transformed.required_tokens, latency_ms)
            .await;

        if is_streaming {
            return Ok(DispatchReply::Stream {
                status,
                headers,
                upstream: response,
                original_model: transformed.original_model,
            });
        }

        let body = response.bytes().await.map_err(|err| {
            ProxyError::internal("failed to read response").with_detail("error", err.to_string())
        })?;

        match serde_json::from_slice::<Value>(&body) {
            Ok(mut parsed) => {
                self.transformer
                    .rewrite_response(&mut parsed, &transformed.original_model);
                Ok(DispatchReply::Json {
                    status,
                    headers,
                    body: parsed,
                })
            }
            Err(_) => Ok(DispatchReply::Raw {
                status,
                headers,
                body,
            }),
        }
    }
}
