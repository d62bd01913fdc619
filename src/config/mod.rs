//! Static configuration: per-instance declarations plus the application
//! sections loaded from YAML.

mod loader;

pub use loader::Loader;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

pub const DEFAULT_API_VERSION: &str = "2024-05-01-preview";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Azure,
    OpenAi,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Azure => "azure",
            ProviderType::OpenAi => "openai",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Failover,
    Weighted,
    RoundRobin,
    LowestUtilization,
    LowestLatency,
    Composite,
}

/// Static per-instance declaration. Mutated at runtime only through the
/// admin surface, restricted to the allow-listed fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub provider_type: ProviderType,
    pub api_key: String,
    pub api_base: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    pub max_tpm: u64,
    #[serde(default)]
    pub max_input_tokens: u64,
    #[serde(default)]
    pub supported_models: Vec<String>,
    #[serde(default)]
    pub model_deployments: HashMap<String, String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub rate_limit_enabled: bool,
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_timeout_seconds() -> f64 {
    30.0
}

impl InstanceConfig {
    pub fn supports_model(&self, model: &str) -> bool {
        let model = model.to_lowercase();
        self.supported_models
            .iter()
            .any(|supported| supported.to_lowercase() == model)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub strategy: RoutingStrategy,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_routing_timeout")]
    pub timeout: u64,
}

fn default_routing_timeout() -> u64 {
    60
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: String,
    #[serde(default = "default_log_max_size")]
    pub max_size: u64,
    #[serde(default)]
    pub backup_count: u32,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_max_size() -> u64 {
    100
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: String::new(),
            max_size: default_log_max_size(),
            backup_count: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_stats_window_minutes")]
    pub stats_window_minutes: u64,
    #[serde(default)]
    pub additional_windows: Vec<u64>,
}

fn default_stats_window_minutes() -> u64 {
    60
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            stats_window_minutes: default_stats_window_minutes(),
            additional_windows: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default)]
    pub redis_password: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            redis_password: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub port: u16,
    pub instances: Vec<InstanceConfig>,
    pub routing: RoutingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Rejects configurations the dispatch core cannot run with. Port range
    /// and provider/strategy spellings are already enforced by the typed
    /// deserialization; the remaining numeric and presence rules live here.
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err(format!("invalid port: {}", self.port));
        }
        if self.instances.is_empty() {
            return Err("no instances configured".to_string());
        }

        let mut seen = HashSet::new();
        for instance in &self.instances {
            validate_instance(instance)?;
            if !seen.insert(instance.name.clone()) {
                return Err(format!("duplicate instance name: {}", instance.name));
            }
        }
        Ok(())
    }
}

fn validate_instance(instance: &InstanceConfig) -> Result<(), String> {
    if instance.name.is_empty() {
        return Err("instance name is required".to_string());
    }
    if instance.api_key.is_empty() {
        return Err(format!("API key is required for instance {}", instance.name));
    }
    if instance.api_base.is_empty() {
        return Err(format!(
            "API base URL is required for instance {}",
            instance.name
        ));
    }
    if instance.weight == 0 {
        return Err(format!(
            "instance weight must be positive for instance {}",
            instance.name
        ));
    }
    if instance.max_tpm == 0 {
        return Err(format!(
            "max TPM must be positive for instance {}",
            instance.name
        ));
    }
    if instance.timeout_seconds <= 0.0 {
        return Err(format!(
            "timeout must be positive for instance {}",
            instance.name
        ));
    }
    Ok(())
}
