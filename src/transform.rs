//! OpenAI → Azure request transformation: validation, token costing,
//! deployment resolution, the `max_tokens` clamp, and the response-side
//! model rewrite.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::config::ProviderType;
use crate::error::ProxyError;
use crate::estimator::TokenEstimator;

/// Reservation ceiling applied to overly generous `max_tokens` requests on
/// Azure S0 tiers; see `transform_to_azure`.
const MAX_TOKENS_CLAMP_MARGIN: u64 = 5000;

/// gpt-4o snapshots from this date misbehave when clamped.
const CLAMP_EXEMPT_MARKER: &str = "2024-05-13";

/// Fallback token estimates when a payload is missing the field the
/// estimator needs (validation failures surface separately).
const DEFAULT_CHAT_TOKENS: u64 = 100;
const DEFAULT_COMPLETION_TOKENS: u64 = 100;
const DEFAULT_EMBEDDING_TOKENS: u64 = 50;

const INTERNAL_METADATA_PREFIX: &str = "_internal_";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyEndpoint {
    ChatCompletions,
    Completions,
    Embeddings,
}

impl ProxyEndpoint {
    pub fn path(&self) -> &'static str {
        match self {
            ProxyEndpoint::ChatCompletions => "/v1/chat/completions",
            ProxyEndpoint::Completions => "/v1/completions",
            ProxyEndpoint::Embeddings => "/v1/embeddings",
        }
    }

    /// Suffix under `/openai/deployments/<deployment>/` on the Azure side.
    pub fn azure_suffix(&self) -> &'static str {
        match self {
            ProxyEndpoint::ChatCompletions => "chat/completions",
            ProxyEndpoint::Completions => "completions",
            ProxyEndpoint::Embeddings => "embeddings",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransformResult {
    /// Lowercased client-supplied model, used to rewrite responses.
    pub original_model: String,
    /// Original payload minus `model`, plus any admission-driven clamp.
    pub payload: Map<String, Value>,
    /// Estimate used for admission and accounting.
    pub required_tokens: u64,
    pub endpoint: ProxyEndpoint,
    pub method: &'static str,
}

pub struct RequestTransformer {
    estimator: TokenEstimator,
}

impl RequestTransformer {
    pub fn new() -> Self {
        Self {
            estimator: TokenEstimator::new(),
        }
    }

    pub fn validate(
        &self,
        endpoint: ProxyEndpoint,
        payload: &Map<String, Value>,
    ) -> Result<(), ProxyError> {
        match endpoint {
            ProxyEndpoint::ChatCompletions => {
                let Some(messages) = payload.get("messages") else {
                    return Err(ProxyError::client(
                        "messages field is required for chat completions",
                        400,
                    ));
                };
                let Some(messages) = messages.as_array() else {
                    return Err(ProxyError::client("messages must be an array", 400));
                };
                if messages.is_empty() {
                    return Err(ProxyError::client("messages array cannot be empty", 400));
                }
                for (index, message) in messages.iter().enumerate() {
                    let Some(fields) = message.as_object() else {
                        return Err(ProxyError::client(
                            format!("message {index} is not a valid object"),
                            400,
                        ));
                    };
                    if !fields.contains_key("role") {
                        return Err(ProxyError::client(
                            format!("message {index} missing required 'role' field"),
                            400,
                        ));
                    }
                    if !fields.contains_key("content") {
                        return Err(ProxyError::client(
                            format!("message {index} missing required 'content' field"),
                            400,
                        ));
                    }
                }
            }
            ProxyEndpoint::Completions => {
                if !payload.contains_key("prompt") {
                    return Err(ProxyError::client(
                        "prompt field is required for completions",
                        400,
                    ));
                }
            }
            ProxyEndpoint::Embeddings => {
                if !payload.contains_key("input") {
                    return Err(ProxyError::client(
                        "input field is required for embeddings",
                        400,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Rewrites an OpenAI-format payload for Azure: drops `model` (Azure
    /// carries the deployment in the URL), estimates the token cost, and
    /// caps runaway `max_tokens` reservations.
    pub fn transform_to_azure(
        &self,
        endpoint: ProxyEndpoint,
        payload: &Map<String, Value>,
    ) -> Result<TransformResult, ProxyError> {
        let model = payload
            .get("model")
            .and_then(|v| v.as_str())
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ProxyError::internal("model name is required"))?
            .to_string();

        let mut azure_payload: Map<String, Value> = payload
            .iter()
            .filter(|(key, _)| key.as_str() != "model")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let required_tokens = self.estimate_tokens(endpoint, &azure_payload, &model)?;

        if let Some(max_tokens) = azure_payload.get("max_tokens").and_then(|v| v.as_u64()) {
            if max_tokens > MAX_TOKENS_CLAMP_MARGIN
                && max_tokens > required_tokens + MAX_TOKENS_CLAMP_MARGIN
                && !model.contains(CLAMP_EXEMPT_MARKER)
            {
                azure_payload.insert(
                    "max_tokens".to_string(),
                    Value::from(required_tokens + MAX_TOKENS_CLAMP_MARGIN),
                );
            }
        }

        Ok(TransformResult {
            original_model: model.to_lowercase(),
            payload: azure_payload,
            required_tokens,
            endpoint,
            method: "POST",
        })
    }

    /// Restores the client's model name in an Azure response body or chunk.
    pub fn rewrite_response(&self, response: &mut Value, original_model: &str) {
        if let Some(fields) = response.as_object_mut() {
            fields.insert("model".to_string(), Value::from(original_model));
        }
    }

    fn estimate_tokens(
        &self,
        endpoint: ProxyEndpoint,
        payload: &Map<String, Value>,
        model: &str,
    ) -> Result<u64, ProxyError> {
        match endpoint {
            ProxyEndpoint::ChatCompletions => {
                let Some(messages) = payload.get("messages").and_then(|v| v.as_array()) else {
                    return Ok(DEFAULT_CHAT_TOKENS);
                };

                let mut functions: Vec<Value> = payload
                    .get("functions")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                if let Some(tools) = payload.get("tools").and_then(|v| v.as_array()) {
                    for tool in tools {
                        if let Some(function) = tool.get("function") {
                            functions.push(function.clone());
                        }
                    }
                }

                Ok(self.estimator.estimate_chat_tokens(
                    messages,
                    &functions,
                    model,
                    ProviderType::Azure,
                ))
            }
            ProxyEndpoint::Completions => {
                match payload.get("prompt").and_then(|v| v.as_str()) {
                    Some(prompt) => Ok(self.estimator.estimate_completion_tokens(
                        prompt,
                        model,
                        ProviderType::Azure,
                    )),
                    None => Ok(DEFAULT_COMPLETION_TOKENS),
                }
            }
            ProxyEndpoint::Embeddings => match payload.get("input") {
                Some(input) => {
                    self.estimator
                        .estimate_embedding_tokens(input, model, ProviderType::Azure)
                }
                None => Ok(DEFAULT_EMBEDDING_TOKENS),
            },
        }
    }
}

impl Default for RequestTransformer {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a model name onto its Azure deployment, retrying with
/// punctuation-stripped variants before falling back to the name itself.
pub fn resolve_deployment(model: &str, deployments: &HashMap<String, String>) -> String {
    let model = model.to_lowercase();
    let variations = [
        model.clone(),
        model.replace('.', ""),
        model.replace('-', ""),
        model.replace('_', ""),
    ];
    for variation in &variations {
        if let Some(deployment) = deployments.get(variation) {
            return deployment.clone();
        }
    }
    model
}

/// Tracing fields injected by the dispatcher; never sent upstream.
pub fn add_internal_metadata(payload: &mut Map<String, Value>, metadata: &Map<String, Value>) {
    for (key, value) in metadata {
        payload.insert(format!("{INTERNAL_METADATA_PREFIX}{key}"), value.clone());
    }
}

pub fn strip_internal_metadata(payload: &Map<String, Value>) -> Map<String, Value> {
    payload
        .iter()
        .filter(|(key, _)| !key.starts_with(INTERNAL_METADATA_PREFIX))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn chat_validation_requires_well_formed_messages() {
        let transformer = RequestTransformer::new();

        let missing = object(json!({"model": "gpt-4"}));
        assert!(transformer
            .validate(ProxyEndpoint::ChatCompletions, &missing)
            .is_err());

        let not_array = object(json!({"messages": "hi"}));
        assert!(transformer
            .validate(ProxyEndpoint::ChatCompletions, &not_array)
            .is_err());

        let empty = object(json!({"messages": []}));
        assert!(transformer
            .validate(ProxyEndpoint::ChatCompletions, &empty)
            .is_err());

        let no_role = object(json!({"messages": [{"content": "hi"}]}));
        assert!(transformer
            .validate(ProxyEndpoint::ChatCompletions, &no_role)
            .is_err());

        let no_content = object(json!({"messages": [{"role": "user"}]}));
        assert!(transformer
            .validate(ProxyEndpoint::ChatCompletions, &no_content)
            .is_err());

        let valid = object(json!({"messages": [{"role": "user", "content": "hi"}]}));
        assert!(transformer
            .validate(ProxyEndpoint::ChatCompletions, &valid)
            .is_ok());
    }

    #[test]
    fn completion_and_embedding_validation_check_required_fields() {
        let transformer = RequestTransformer::new();
        assert!(transformer
            .validate(ProxyEndpoint::Completions, &object(json!({})))
            .is_err());
        assert!(transformer
            .validate(ProxyEndpoint::Completions, &object(json!({"prompt": "hi"})))
            .is_ok());
        assert!(transformer
            .validate(ProxyEndpoint::Embeddings, &object(json!({})))
            .is_err());
        assert!(transformer
            .validate(ProxyEndpoint::Embeddings, &object(json!({"input": "hi"})))
            .is_ok());
    }

    #[test]
    fn transform_drops_model_and_lowercases_original() {
        let transformer = RequestTransformer::new();
        let payload = object(json!({
            "model": "GPT-4",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2,
        }));

        let result = transformer
            .transform_to_azure(ProxyEndpoint::ChatCompletions, &payload)
            .unwrap();
        assert_eq!(result.original_model, "gpt-4");
        assert!(!result.payload.contains_key("model"));
        assert_eq!(result.payload.get("temperature"), Some(&json!(0.2)));
        assert!(result.required_tokens >= 1);
        assert_eq!(result.method, "POST");
    }

    #[test]
    fn transform_requires_a_model_name() {
        let transformer = RequestTransformer::new();
        let payload = object(json!({"messages": [{"role": "user", "content": "hi"}]}));
        let err = transformer
            .transform_to_azure(ProxyEndpoint::ChatCompletions, &payload)
            .unwrap_err();
        assert_eq!(err.status_code, 500);
    }

    #[test]
    fn max_tokens_clamp_fires_on_generous_reservations() {
        let transformer = RequestTransformer::new();
        let payload = object(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 50_000,
        }));

        let result = transformer
            .transform_to_azure(ProxyEndpoint::ChatCompletions, &payload)
            .unwrap();
        let clamped = result.payload.get("max_tokens").unwrap().as_u64().unwrap();
        assert_eq!(clamped, result.required_tokens + 5000);
    }

    #[test]
    fn max_tokens_clamp_spares_exempt_snapshots_and_modest_values() {
        let transformer = RequestTransformer::new();

        let exempt = object(json!({
            "model": "gpt-4o-2024-05-13",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 50_000,
        }));
        let result = transformer
            .transform_to_azure(ProxyEndpoint::ChatCompletions, &exempt)
            .unwrap();
        assert_eq!(result.payload.get("max_tokens"), Some(&json!(50_000)));

        let modest = object(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 4_000,
        }));
        let result = transformer
            .transform_to_azure(ProxyEndpoint::ChatCompletions, &modest)
            .unwrap();
        assert_eq!(result.payload.get("max_tokens"), Some(&json!(4_000)));
    }

    #[test]
    fn response_rewrite_restores_original_model() {
        let transformer = RequestTransformer::new();
        let mut response = json!({"id": "x", "model": "gpt-4-0613", "choices": []});
        transformer.rewrite_response(&mut response, "gpt-4");
        assert_eq!(response["model"], json!("gpt-4"));
    }

    #[test]
    fn round_trip_preserves_every_other_field() {
        let transformer = RequestTransformer::new();
        let payload = object(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.7,
            "top_p": 0.9,
            "stream": false,
            "user": "tester",
        }));

        let result = transformer
            .transform_to_azure(ProxyEndpoint::ChatCompletions, &payload)
            .unwrap();
        let mut response = Value::Object(result.payload.clone());
        transformer.rewrite_response(&mut response, &result.original_model);
        let round_tripped = response.as_object().unwrap();

        for (key, value) in &payload {
            if key == "model" {
                assert_eq!(round_tripped.get(key), Some(&json!("gpt-4")));
            } else {
                assert_eq!(round_tripped.get(key), Some(value), "field {key}");
            }
        }
    }

    #[test]
    fn deployment_resolution_tries_punctuation_variants() {
        let mut deployments = HashMap::new();
        deployments.insert("gpt-4".to_string(), "prod-gpt4".to_string());
        deployments.insert("gpt35turbo".to_string(), "prod-gpt35".to_string());

        assert_eq!(resolve_deployment("GPT-4", &deployments), "prod-gpt4");
        assert_eq!(resolve_deployment("gpt-3.5_turbo", &deployments), "gpt-3.5_turbo");
        assert_eq!(resolve_deployment("gpt-35-turbo", &deployments), "prod-gpt35");
        assert_eq!(resolve_deployment("unknown", &deployments), "unknown");
    }

    #[test]
    fn internal_metadata_is_injected_and_stripped() {
        let mut payload = object(json!({"prompt": "hi"}));
        let metadata = object(json!({"request_id": "req-1"}));
        add_internal_metadata(&mut payload, &metadata);
        assert!(payload.contains_key("_internal_request_id"));

        let cleaned = strip_internal_metadata(&payload);
        assert!(!cleaned.contains_key("_internal_request_id"));
        assert!(cleaned.contains_key("prompt"));
    }
}
