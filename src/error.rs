use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// The four error kinds surfaced across the API boundary. Nothing else
/// (reqwest, redis, serde failures) leaks to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    #[serde(rename = "client_error")]
    Client,
    #[serde(rename = "upstream_error")]
    Upstream,
    #[serde(rename = "instance_error")]
    Instance,
    #[serde(rename = "internal_error")]
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Client => "client_error",
            ErrorKind::Upstream => "upstream_error",
            ErrorKind::Instance => "instance_error",
            ErrorKind::Internal => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error)]
#[error("{kind}: {message}")]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub message: String,
    pub status_code: u16,
    pub details: Map<String, Value>,
    pub timestamp: i64,
}

impl ProxyError {
    fn new(kind: ErrorKind, message: impl Into<String>, status_code: u16) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code,
            details: Map::new(),
            timestamp: unix_now(),
        }
    }

    pub fn client(message: impl Into<String>, status_code: u16) -> Self {
        Self::new(ErrorKind::Client, message, status_code)
    }

    pub fn upstream(message: impl Into<String>, status_code: u16) -> Self {
        Self::new(ErrorKind::Upstream, message, status_code)
    }

    pub fn instance(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Instance, message, 503)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message, 500)
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_retry_after(self, seconds: u64) -> Self {
        self.with_detail("retry_after", seconds)
    }

    /// Seconds the client should wait before retrying, 0 when unknown.
    pub fn retry_after(&self) -> u64 {
        match self.details.get("retry_after") {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().map(|f| f as u64))
                .unwrap_or(0),
            _ => 0,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ErrorKind::Upstream => self.status_code >= 500 || self.status_code == 429,
            ErrorKind::Instance => true,
            ErrorKind::Internal => self.status_code >= 500,
            ErrorKind::Client => false,
        }
    }
}

/// Maps an HTTP status and error source to a kind. `source` is `"upstream"`
/// for errors observed on a backend response, empty otherwise.
pub fn classify(status_code: u16, source: &str) -> ErrorKind {
    match status_code {
        400..=499 if source == "upstream" => ErrorKind::Upstream,
        400..=499 => ErrorKind::Client,
        500.. if source == "upstream" => ErrorKind::Upstream,
        500.. => ErrorKind::Instance,
        _ => ErrorKind::Internal,
    }
}

/// Coordination-store failures. Kept separate from `ProxyError` so callers
/// decide per call site whether to fail open, log-and-drop, or surface.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn unix_now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
