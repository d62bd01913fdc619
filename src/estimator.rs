//! Approximate input-token costing for chat, completion, and embedding
//! payloads. Counts are admission estimates, not billing.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use tiktoken_rs::{tokenizer, CoreBPE};

use crate::config::ProviderType;
use crate::error::ProxyError;

/// Fixed per-image token cost, plus the surcharge for high-detail parts.
const IMAGE_BASE_TOKENS: u64 = 85;
const IMAGE_HIGH_DETAIL_TOKENS: u64 = 170;

/// Overhead added per declared function/tool.
const TOKENS_PER_FUNCTION: u64 = 6;

/// Every reply is primed with `<|start|>assistant<|message|>`.
const REPLY_PRIMING_TOKENS: u64 = 3;

pub struct TokenEstimator {
    encoders: RwLock<HashMap<String, &'static CoreBPE>>,
}

impl TokenEstimator {
    pub fn new() -> Self {
        Self {
            encoders: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves the BPE table for a model, canonicalizing Azure deployment
    /// spellings first so they do not defeat family detection. Cached per
    /// model name with a double-checked write path.
    pub fn encoder_for_model(&self, model: &str, provider: ProviderType) -> &'static CoreBPE {
        let key = model.to_lowercase();
        if let Some(encoder) = self.encoders.read().expect("encoder cache").get(&key).copied() {
            return encoder;
        }

        let mut encoders = self.encoders.write().expect("encoder cache");
        if let Some(encoder) = encoders.get(&key).copied() {
            return encoder;
        }

        let actual_model = match provider {
            ProviderType::Azure => canonical_azure_model(&key),
            ProviderType::OpenAi => key.as_str(),
        };
        let encoder = bpe_for_model(actual_model);
        encoders.insert(key, encoder);
        encoder
    }

    pub fn estimate_chat_tokens(
        &self,
        messages: &[Value],
        functions: &[Value],
        model: &str,
        provider: ProviderType,
    ) -> u64 {
        let encoder = self.encoder_for_model(model, provider);

        let tokens_per_message = if model.to_lowercase().contains("gpt-4") {
            4
        } else {
            3
        };

        let mut count: u64 = 0;
        for message in messages {
            let Some(fields) = message.as_object() else {
                continue;
            };
            count += tokens_per_message;
            for (key, value) in fields {
                if key == "content" {
                    count += content_tokens(encoder, value);
                } else if let Some(text) = value.as_str() {
                    count += encode_len(encoder, text);
                }
            }
        }

        for function in functions {
            count += TOKENS_PER_FUNCTION;
            count += encode_len(encoder, &stringify_function(function));
        }

        count += REPLY_PRIMING_TOKENS;
        count.max(1)
    }

    pub fn estimate_completion_tokens(
        &self,
        prompt: &str,
        model: &str,
        provider: ProviderType,
    ) -> u64 {
        let encoder = self.encoder_for_model(model, provider);
        encode_len(encoder, prompt).max(1)
    }

    pub fn estimate_embedding_tokens(
        &self,
        input: &Value,
        model: &str,
        provider: ProviderType,
    ) -> Result<u64, ProxyError> {
        let encoder = self.encoder_for_model(model, provider);

        let total = match input {
            Value::String(text) => encode_len(encoder, text),
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.as_str())
                .map(|text| encode_len(encoder, text))
                .sum(),
            _ => {
                return Err(ProxyError::internal(
                    "unsupported input type for embedding estimation",
                ))
            }
        };
        Ok(total.max(1))
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

fn canonical_azure_model(model: &str) -> &str {
    match model {
        "gpt-4" => "gpt-4-0613",
        "gpt-4o" => "gpt-4o-2024-05-13",
        "gpt-35-turbo" | "gpt-3.5-turbo" => "gpt-3.5-turbo-0613",
        other => other,
    }
}

fn bpe_for_model(model: &str) -> &'static CoreBPE {
    let tokenizer = tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase);
    match tokenizer {
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    }
}

fn encode_len(encoder: &CoreBPE, text: &str) -> u64 {
    encoder.encode_with_special_tokens(text).len() as u64
}

/// `content` may be a plain string or a list of multimodal parts.
fn content_tokens(encoder: &CoreBPE, content: &Value) -> u64 {
    match content {
        Value::String(text) => encode_len(encoder, text),
        Value::Array(parts) => parts
            .iter()
            .map(|part| match part {
                Value::String(text) => encode_len(encoder, text),
                Value::Object(fields) => {
                    let mut tokens = 0;
                    if let Some(text) = fields.get("text").and_then(|v| v.as_str()) {
                        tokens += encode_len(encoder, text);
                    }
                    if fields.get("type").and_then(|v| v.as_str()) == Some("image_url") {
                        tokens += IMAGE_BASE_TOKENS;
                        if fields.get("detail").and_then(|v| v.as_str()) == Some("high") {
                            tokens += IMAGE_HIGH_DETAIL_TOKENS;
                        }
                    }
                    tokens
                }
                _ => 0,
            })
            .sum(),
        _ => 0,
    }
}

/// Flattens a function declaration into the space-joined string that gets
/// tokenized: name, description, then the parameter schema.
fn stringify_function(function: &Value) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
        parts.push(name.to_string());
    }
    if let Some(description) = function.get("description").and_then(|v| v.as_str()) {
        parts.push(description.to_string());
    }
    if let Some(parameters) = function.get("parameters").and_then(|v| v.as_object()) {
        let flattened = stringify_parameters(parameters);
        if !flattened.is_empty() {
            parts.push(flattened);
        }
    }

    parts.join(" ")
}

fn stringify_parameters(params: &serde_json::Map<String, Value>) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(param_type) = params.get("type").and_then(|v| v.as_str()) {
        parts.push(param_type.to_string());
    }

    if let Some(properties) = params.get("properties").and_then(|v| v.as_object()) {
        for (prop_name, prop_def) in properties {
            parts.push(prop_name.clone());
            if let Some(prop_type) = prop_def.get("type").and_then(|v| v.as_str()) {
                parts.push(prop_type.to_string());
            }
            if let Some(description) = prop_def.get("description").and_then(|v| v.as_str()) {
                parts.push(description.to_string());
            }
        }
    }

    if let Some(required) = params.get("required").and_then(|v| v.as_array()) {
        for item in required {
            if let Some(name) = item.as_str() {
                parts.push(name.to_string());
            }
        }
    }

    parts.join(" ")
}
