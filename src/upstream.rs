//! Per-instance HTTP client for Azure OpenAI: URL construction in the
//! deployment dialect, `api-key` auth, streaming passthrough, error
//! envelope parsing, and `Retry-After` extraction.

use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use serde_json::{Map, Value};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::config::{InstanceConfig, ProviderType, DEFAULT_API_VERSION};
use crate::error::ProxyError;
use crate::transform::ProxyEndpoint;

const USER_AGENT: &str = "Azure-OpenAI-Proxy/1.0";

/// Opaque but present `Retry-After` values fall back to a minute.
const DEFAULT_RETRY_AFTER_SECONDS: u64 = 60;

pub struct AzureClient {
    client: reqwest::Client,
    config: InstanceConfig,
}

impl AzureClient {
    pub fn new(config: InstanceConfig) -> Result<Self, ProxyError> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs_f64(config.timeout_seconds.max(0.0)));

        if let Some(proxy_url) = config.proxy_url.as_deref().filter(|url| !url.is_empty()) {
            match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(err) => {
                    tracing::warn!(
                        instance = %config.name,
                        error = %err,
                        "ignoring invalid proxy url"
                    );
                }
            }
        }

        let client = builder.build().map_err(|err| {
            ProxyError::internal(format!("failed to build http client: {err}"))
                .with_detail("instance", config.name.clone())
        })?;

        Ok(Self { client, config })
    }

    pub fn instance_name(&self) -> &str {
        &self.config.name
    }

    /// `<api_base>/openai/deployments/<deployment>/<suffix>?api-version=<v>`
    pub fn build_url(&self, endpoint: ProxyEndpoint, deployment: &str) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        let api_version = if self.config.api_version.is_empty() {
            DEFAULT_API_VERSION
        } else {
            &self.config.api_version
        };
        format!(
            "{base}/openai/deployments/{deployment}/{}?api-version={api_version}",
            endpoint.azure_suffix()
        )
    }

    pub async fn proxy_request(
        &self,
        endpoint: ProxyEndpoint,
        payload: &Map<String, Value>,
        deployment: &str,
    ) -> Result<reqwest::Response, ProxyError> {
        let url = self.build_url(endpoint, deployment);

        let body = serde_json::to_vec(payload).map_err(|err| {
            ProxyError::internal("failed to marshal request payload")
                .with_detail("error", err.to_string())
        })?;

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("api-key", &self.config.api_key)
            .header("User-Agent", USER_AGENT)
            .body(body);
        if self.config.provider_type == ProviderType::Azure {
            request = request.header("Accept", "application/json");
        }

        request.send().await.map_err(|err| {
            ProxyError::upstream("request to Azure OpenAI failed", 500)
                .with_detail("error", err.to_string())
                .with_detail("url", url)
                .with_detail("deployment", deployment)
        })
    }

    /// Same call with `stream = true` forced into the payload. The body is
    /// not consumed here; the dispatcher relays it chunk by chunk.
    pub async fn stream_request(
        &self,
        endpoint: ProxyEndpoint,
        mut payload: Map<String, Value>,
        deployment: &str,
    ) -> Result<reqwest::Response, ProxyError> {
        payload.insert("stream".to_string(), Value::from(true));
        self.proxy_request(endpoint, &payload, deployment).await
    }

    /// Lightweight probe used by the health sweeper: GET `<api_base>/models`
    /// with the instance key; any status below 400 counts as healthy.
    pub async fn health_check(&self) -> Result<f64, String> {
        let base = self.config.api_base.trim_end_matches('/');
        let api_version = if self.config.api_version.is_empty() {
            DEFAULT_API_VERSION
        } else {
            &self.config.api_version
        };
        let url = format!("{base}/models?api-version={api_version}");

        let started = Instant::now();
        let response = self
            .client
            .get(&url)
            .header("api-key", &self.config.api_key)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|err| format!("health check request failed: {err}"))?;

        if response.status().as_u16() >= 400 {
            return Err(format!(
                "health check failed with status {}",
                response.status().as_u16()
            ));
        }
        Ok(started.elapsed().as_secs_f64() * 1000.0)
    }
}

/// Reads the upstream error body and shapes it into an `UpstreamError`,
/// pulling `message`/`type` out of a JSON `{error: {...}}` envelope when
/// one is present.
pub async fn parse_error_response(response: reqwest::Response) -> ProxyError {
    let status = response.status().as_u16();
    let retry_after = retry_after_seconds(response.headers());
    let body = response.bytes().await.unwrap_or_default();
    let body_text = String::from_utf8_lossy(&body).into_owned();

    let mut message = body_text.clone();
    let mut error_type = String::new();
    if let Ok(parsed) = serde_json::from_slice::<Value>(&body) {
        if let Some(error) = parsed.get("error") {
            if let Some(msg) = error.get("message").and_then(|v| v.as_str()) {
                message = msg.to_string();
            }
            if let Some(kind) = error.get("type").and_then(|v| v.as_str()) {
                error_type = kind.to_string();
            }
        }
    }

    let mut err = ProxyError::upstream(message, status)
        .with_detail("response_body", body_text)
        .with_detail("error_type", error_type)
        .with_detail("status_code", status);
    if retry_after > 0 {
        err = err.with_retry_after(retry_after);
    }
    err
}

/// `Retry-After` per RFC 9110: integer seconds or an HTTP-date. Absent or
/// empty yields 0; present but opaque yields the 60s default.
pub fn retry_after_seconds(headers: &HeaderMap) -> u64 {
    let Some(value) = headers
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    else {
        return 0;
    };

    if let Ok(seconds) = value.trim().parse::<i64>() {
        if seconds > 0 {
            return seconds as u64;
        }
        return DEFAULT_RETRY_AFTER_SECONDS;
    }

    if let Some(seconds) = parse_http_date_delta(value) {
        if seconds > 0 {
            return seconds as u64;
        }
    }
    DEFAULT_RETRY_AFTER_SECONDS
}

fn parse_http_date_delta(value: &str) -> Option<i64> {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    let parsed = PrimitiveDateTime::parse(value, &format).ok()?;
    Some(parsed.assume_utc().unix_timestamp() - OffsetDateTime::now_utc().unix_timestamp())
}
