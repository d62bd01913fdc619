//! The three OpenAI-format proxy endpoints and the streaming relay glue.

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::Value;

use super::{error_response, AppState};
use crate::dispatch::DispatchReply;
use crate::error::ProxyError;
use crate::sse;
use crate::transform::ProxyEndpoint;

pub async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    handle(state, ProxyEndpoint::ChatCompletions, body).await
}

pub async fn completions(State(state): State<AppState>, body: Bytes) -> Response {
    handle(state, ProxyEndpoint::Completions, body).await
}

pub async fn embeddings(State(state): State<AppState>, body: Bytes) -> Response {
    handle(state, ProxyEndpoint::Embeddings, body).await
}

async fn handle(state: AppState, endpoint: ProxyEndpoint, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return error_response(&ProxyError::client("invalid JSON payload", 400)),
    };

    match state.dispatcher.dispatch(endpoint, payload).await {
        Ok(DispatchReply::Json {
            status,
            headers,
            body,
        }) => json_response(status, &headers, body),
        Ok(DispatchReply::Raw {
            status,
            headers,
            body,
        }) => raw_response(status, &headers, body),
        Ok(DispatchReply::Stream {
            status,
            headers,
            upstream,
            original_model,
        }) => stream_response(status, &headers, upstream, original_model),
        Err(err) => {
            tracing::error!(
                kind = err.kind.as_str(),
                status = err.status_code,
                endpoint = endpoint.path(),
                "{}",
                err.message
            );
            error_response(&err)
        }
    }
}

fn json_response(status: u16, upstream_headers: &HeaderMap, body: Value) -> Response {
    let mut response = Json(body).into_response();
    *response.status_mut() =
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    copy_headers(upstream_headers, response.headers_mut(), |name| {
        // The body is re-serialized, so framing headers must not survive.
        name != &CONTENT_LENGTH && name != &TRANSFER_ENCODING && name != &CONTENT_TYPE
    });
    response
}

fn raw_response(status: u16, upstream_headers: &HeaderMap, body: Bytes) -> Response {
    let mut response = body.into_response();
    *response.status_mut() =
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    copy_headers(upstream_headers, response.headers_mut(), |name| {
        name != &CONTENT_LENGTH && name != &TRANSFER_ENCODING
    });
    response
}

fn stream_response(
    status: u16,
    upstream_headers: &HeaderMap,
    upstream: reqwest::Response,
    original_model: String,
) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("access-control-allow-origin"),
        HeaderValue::from_static("*"),
    );
    copy_headers(upstream_headers, &mut headers, |name| {
        !name.as_str().starts_with("content-")
            && name != &CACHE_CONTROL
            && name != &CONNECTION
            && name != &TRANSFER_ENCODING
    });

    let mut response = Response::new(Body::from_stream(sse::relay_stream(
        upstream,
        original_model,
    )));
    *response.status_mut() =
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    *response.headers_mut() = headers;
    response
}

fn copy_headers(
    source: &HeaderMap,
    target: &mut HeaderMap,
    keep: impl Fn(&HeaderName) -> bool,
) {
    for (name, value) in source {
        if keep(name) {
            target.insert(name.clone(), value.clone());
        }
    }
}
