//! Instance registry: configs, per-instance rate limiters, and the state
//! store handle. Dispatch and the health sweeper both go through here; the
//! store owns cross-replica truth, this registry only caches factories.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::config::{InstanceConfig, ProviderType, RoutingStrategy};
use crate::error::{unix_now, unix_now_nanos, ProxyError, StoreError};
use crate::rate_limit::RateLimiter;
use crate::selector::{filter_by_capability, rank, Candidate};
use crate::state::{ErrorOrigin, InstanceState, InstanceStatus};
use crate::store::{usage_log_key, StateStore, WindowStore};
use crate::store::{USAGE_LOG_RETENTION_SECONDS, USAGE_LOG_TTL_SECONDS};

/// Fields the admin surface may change at runtime.
const ALLOWED_CONFIG_UPDATES: [&str; 8] = [
    "enabled",
    "weight",
    "priority",
    "max_tpm",
    "max_input_tokens",
    "timeout_seconds",
    "retry_count",
    "rate_limit_enabled",
];

pub struct InstanceManager {
    configs: RwLock<Vec<InstanceConfig>>,
    strategy: RoutingStrategy,
    state_store: Arc<dyn StateStore>,
    window_store: Arc<dyn WindowStore>,
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct InstanceOverview {
    pub status: InstanceStatus,
    pub health_status: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub total_tokens_served: u64,
    pub current_tpm: u64,
    pub current_rpm: u64,
    pub error_count: u64,
    pub utilization_percent: f64,
    pub last_used: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct FleetStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub instances: HashMap<String, InstanceOverview>,
}

impl InstanceManager {
    pub fn new(
        instances: Vec<InstanceConfig>,
        strategy: RoutingStrategy,
        state_store: Arc<dyn StateStore>,
        window_store: Arc<dyn WindowStore>,
    ) -> Self {
        let mut limiters = HashMap::new();
        for instance in &instances {
            if instance.enabled && instance.rate_limit_enabled {
                limiters.insert(
                    instance.name.clone(),
                    Arc::new(RateLimiter::new(
                        instance.name.clone(),
                        instance.max_tpm,
                        instance.max_input_tokens,
                        window_store.clone(),
                    )),
                );
            }
        }

        Self {
            configs: RwLock::new(instances),
            strategy,
            state_store,
            window_store,
            limiters: RwLock::new(limiters),
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    pub async fn all_configs(&self) -> Vec<InstanceConfig> {
        self.configs.read().await.clone()
    }

    pub async fn instance_config(&self, name: &str) -> Option<InstanceConfig> {
        self.configs
            .read()
            .await
            .iter()
            .find(|config| config.name == name)
            .cloned()
    }

    pub async fn rate_limiter(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.read().await.get(name).cloned()
    }

    pub async fn instance_state(&self, name: &str) -> Result<InstanceState, StoreError> {
        self.state_store.get(name).await
    }

    pub async fn set_instance_state(
        &self,
        name: &str,
        state: &InstanceState,
    ) -> Result<(), StoreError> {
        self.state_store.set(name, state).await
    }

    /// Admission check for one instance; `(true, 0)` when rate limiting is
    /// not configured for it.
    pub async fn check_rate_limit(&self, name: &str, tokens: u64) -> (bool, u64) {
        match self.rate_limiter(name).await {
            Some(limiter) => limiter.check_capacity(tokens).await,
            None => (true, 0),
        }
    }

    /// Selection pipeline: capability filter, health filter, admission
    /// filter, then the strategy ranker over the survivors.
    pub async fn select_instance(
        &self,
        model: &str,
        tokens: u64,
        provider: Option<ProviderType>,
    ) -> Result<String, ProxyError> {
        let configs = self.all_configs().await;
        let filtered: Vec<InstanceConfig> = filter_by_capability(&configs, model, tokens, provider)
            .into_iter()
            .cloned()
            .collect();
        if filtered.is_empty() {
            return Err(ProxyError::instance(format!(
                "no suitable instances found for model {model}"
            )));
        }

        let now = unix_now();
        let mut candidates = Vec::with_capacity(filtered.len());
        for config in filtered {
            // Skip instances whose state cannot be read.
            let Ok(mut state) = self.state_store.get(&config.name).await else {
                continue;
            };
            state.refresh_rate_limit(now);
            if !state.is_healthy() {
                continue;
            }

            let (admitted, _) = self.check_rate_limit(&config.name, tokens).await;
            if !admitted {
                continue;
            }

            candidates.push(Candidate { config, state });
        }

        if candidates.is_empty() {
            return Err(ProxyError::instance(format!(
                "no healthy instances with capacity found for model {model}"
            )));
        }

        rank(self.strategy, &candidates).ok_or_else(|| {
            ProxyError::instance(format!("no healthy instances with capacity found for model {model}"))
        })
    }

    /// Success accounting: rate-limit window, usage log, and the state
    /// snapshot. Store failures here are logged and dropped; the request
    /// has already succeeded.
    pub async fn record_success(&self, name: &str, tokens: u64, latency_ms: f64) {
        if let Some(limiter) = self.rate_limiter(name).await {
            if let Err(err) = limiter.update_usage(tokens).await {
                tracing::warn!(instance = name, error = %err, "failed to update usage window");
            }
        }

        let now = unix_now();
        let member = format!("{tokens}:{}", unix_now_nanos());
        if let Err(err) = self
            .window_store
            .record(
                &usage_log_key(name),
                &member,
                now,
                now - USAGE_LOG_RETENTION_SECONDS,
                USAGE_LOG_TTL_SECONDS,
            )
            .await
        {
            tracing::warn!(instance = name, error = %err, "failed to append usage log");
        }

        let max_tpm = self
            .instance_config(name)
            .await
            .map(|config| config.max_tpm)
            .unwrap_or(0);

        match self.state_store.get(name).await {
            Ok(mut state) => {
                state.record_success(tokens, latency_ms, max_tpm, now);
                if let Err(err) = self.state_store.set(name, &state).await {
                    tracing::warn!(instance = name, error = %err, "failed to persist state");
                }
            }
            Err(err) => {
                tracing::warn!(instance = name, error = %err, "failed to load state");
            }
        }
    }

    /// Error accounting. An upstream 429 additionally opens a rate-limited
    /// exclusion window so selection skips the instance until it lapses.
    pub async fn record_error(
        &self,
        name: &str,
        status_code: u16,
        origin: ErrorOrigin,
        message: &str,
        retry_after: u64,
    ) {
        let now = unix_now();
        match self.state_store.get(name).await {
            Ok(mut state) => {
                state.record_error(status_code, origin, message, now);
                if origin == ErrorOrigin::Upstream && status_code == 429 {
                    let window = if retry_after > 0 { retry_after } else { 60 };
                    state.mark_rate_limited(now + window as i64);
                }
                if let Err(err) = self.state_store.set(name, &state).await {
                    tracing::warn!(instance = name, error = %err, "failed to persist state");
                }
            }
            Err(err) => {
                tracing::warn!(instance = name, error = %err, "failed to load state");
            }
        }
    }

    /// Health sweeper write path: read-modify-write of the health triplet,
    /// last write wins.
    pub async fn apply_health_result(
        &self,
        name: &str,
        healthy: bool,
        latency_ms: f64,
        error: Option<String>,
    ) {
        let Ok(mut state) = self.state_store.get(name).await else {
            return;
        };

        if healthy {
            state.status = InstanceStatus::Healthy;
            state.health_status = "healthy".to_string();
            state.connection_status = "connected".to_string();
            tracing::debug!(instance = name, latency_ms, "health probe ok");
        } else {
            state.status = InstanceStatus::Error;
            state.health_status = "unhealthy".to_string();
            state.connection_status = "disconnected".to_string();
            if let Some(message) = error {
                state.last_error = Some(message);
                state.last_error_time = Some(unix_now());
            }
        }

        if let Err(err) = self.state_store.set(name, &state).await {
            tracing::warn!(instance = name, error = %err, "failed to persist health result");
        }
    }

    /// Clears durable state and the rate-limit window. Idempotent: resetting
    /// a clean instance is a no-op.
    pub async fn reset_instance(&self, name: &str) -> Result<(), ProxyError> {
        self.state_store.delete(name).await.map_err(|err| {
            ProxyError::internal(format!("failed to reset instance state: {err}"))
        })?;

        if let Some(limiter) = self.rate_limiter(name).await {
            limiter.reset().await.map_err(|err| {
                ProxyError::internal(format!("failed to reset rate limiter: {err}"))
            })?;
        }

        if let Err(err) = self.window_store.del(&usage_log_key(name)).await {
            tracing::warn!(instance = name, error = %err, "failed to clear usage log");
        }
        Ok(())
    }

    /// Applies an allow-listed admin update and pushes limit changes into
    /// the live rate limiter.
    pub async fn update_instance_config(
        &self,
        name: &str,
        updates: &Map<String, Value>,
    ) -> Result<InstanceConfig, ProxyError> {
        for key in updates.keys() {
            if !ALLOWED_CONFIG_UPDATES.contains(&key.as_str()) {
                return Err(ProxyError::client(
                    format!("field cannot be updated at runtime: {key}"),
                    400,
                )
                .with_detail(
                    "allowed_fields",
                    Value::from(
                        ALLOWED_CONFIG_UPDATES
                            .iter()
                            .map(|f| Value::from(*f))
                            .collect::<Vec<_>>(),
                    ),
                ));
            }
        }

        let mut configs = self.configs.write().await;
        let config = configs
            .iter_mut()
            .find(|config| config.name == name)
            .ok_or_else(|| ProxyError::client(format!("instance not found: {name}"), 404))?;

        let mut updated = false;
        for (key, value) in updates {
            match key.as_str() {
                "enabled" => {
                    if let Some(v) = value.as_bool() {
                        config.enabled = v;
                        updated = true;
                    }
                }
                "weight" => {
                    if let Some(v) = value.as_u64() {
                        config.weight = v as u32;
                        updated = true;
                    }
                }
                "priority" => {
                    if let Some(v) = value.as_u64() {
                        config.priority = v as u32;
                        updated = true;
                    }
                }
                "max_tpm" => {
                    if let Some(v) = value.as_u64() {
                        config.max_tpm = v;
                        updated = true;
                    }
                }
                "max_input_tokens" => {
                    if let Some(v) = value.as_u64() {
                        config.max_input_tokens = v;
                        updated = true;
                    }
                }
                "timeout_seconds" => {
                    if let Some(v) = value.as_f64() {
                        config.timeout_seconds = v;
                        updated = true;
                    }
                }
                "retry_count" => {
                    if let Some(v) = value.as_u64() {
                        config.retry_count = v as u32;
                        updated = true;
                    }
                }
                "rate_limit_enabled" => {
                    if let Some(v) = value.as_bool() {
                        config.rate_limit_enabled = v;
                        updated = true;
                    }
                }
                _ => {}
            }
        }

        if !updated {
            return Err(ProxyError::client("no valid updates provided", 400));
        }

        let config = config.clone();
        drop(configs);

        let mut limiters = self.limiters.write().await;
        if config.enabled && config.rate_limit_enabled {
            match limiters.get(&config.name) {
                Some(limiter) => limiter.set_limits(config.max_tpm, config.max_input_tokens),
                None => {
                    limiters.insert(
                        config.name.clone(),
                        Arc::new(RateLimiter::new(
                            config.name.clone(),
                            config.max_tpm,
                            config.max_input_tokens,
                            self.window_store.clone(),
                        )),
                    );
                }
            }
        }

        Ok(config)
    }

    /// Fleet-wide aggregates for the admin and stats surfaces.
    pub async fn fleet_stats(&self) -> Result<FleetStats, StoreError> {
        let configs = self.all_configs().await;
        let now = unix_now();

        let mut stats = FleetStats {
            total_instances: configs.len(),
            healthy_instances: 0,
            total_requests: 0,
            total_tokens: 0,
            instances: HashMap::with_capacity(configs.len()),
        };

        for config in &configs {
            let mut state = self.state_store.get(&config.name).await?;
            state.refresh_rate_limit(now);

            if state.is_healthy() {
                stats.healthy_instances += 1;
            }
            stats.total_requests += state.total_requests;
            stats.total_tokens += state.total_tokens_served;
            stats.instances.insert(
                config.name.clone(),
                InstanceOverview {
                    status: state.status,
                    health_status: state.health_status.clone(),
                    total_requests: state.total_requests,
                    successful_requests: state.successful_requests,
                    total_tokens_served: state.total_tokens_served,
                    current_tpm: state.current_tpm,
                    current_rpm: state.current_rpm,
                    error_count: state.error_count,
                    utilization_percent: state.utilization_percentage,
                    last_used: state.last_used,
                },
            );
        }

        Ok(stats)
    }

    /// Historical usage samples for an instance within `window_seconds`,
    /// read from the longer-horizon usage log.
    pub async fn usage_samples(
        &self,
        name: &str,
        window_seconds: i64,
    ) -> Result<Vec<(i64, u64)>, StoreError> {
        let cutoff = unix_now() - window_seconds;
        let entries = self
            .window_store
            .zrange_with_scores(&usage_log_key(name))
            .await?;
        Ok(entries
            .into_iter()
            .filter(|(_, score)| *score >= cutoff)
            .filter_map(|(member, score)| {
                crate::store::member_tokens(&member).map(|tokens| (score, tokens))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    fn instance(name: &str, priority: u32) -> InstanceConfig {
        InstanceConfig {
            name: name.to_string(),
            provider_type: ProviderType::Azure,
            api_key: "key".to_string(),
            api_base: "https://example.openai.azure.com".to_string(),
            api_version: crate::config::DEFAULT_API_VERSION.to_string(),
            proxy_url: None,
            priority,
            weight: 1,
            max_tpm: 60_000,
            max_input_tokens: 0,
            supported_models: vec!["gpt-4".to_string()],
            model_deployments: StdHashMap::new(),
            enabled: true,
            timeout_seconds: 30.0,
            retry_count: 0,
            rate_limit_enabled: true,
        }
    }

    fn manager(instances: Vec<InstanceConfig>, strategy: RoutingStrategy) -> InstanceManager {
        let store = Arc::new(MemoryStore::new());
        InstanceManager::new(instances, strategy, store.clone(), store)
    }

    #[tokio::test]
    async fn failover_selects_lowest_priority_until_demoted() {
        let manager = manager(
            vec![instance("a", 1), instance("b", 2)],
            RoutingStrategy::Failover,
        );

        let selected = manager.select_instance("gpt-4", 0, None).await.unwrap();
        assert_eq!(selected, "a");

        // Eleven straight upstream failures demote instance a.
        for _ in 0..11 {
            manager
                .record_error("a", 500, ErrorOrigin::Upstream, "boom", 0)
                .await;
        }
        let selected = manager.select_instance("gpt-4", 0, None).await.unwrap();
        assert_eq!(selected, "b");
    }

    #[tokio::test]
    async fn selection_skips_rate_limited_instances_until_window_lapses() {
        let manager = manager(
            vec![instance("a", 1), instance("b", 2)],
            RoutingStrategy::Failover,
        );

        manager
            .record_error("a", 429, ErrorOrigin::Upstream, "rate limit exceeded", 30)
            .await;
        let selected = manager.select_instance("gpt-4", 0, None).await.unwrap();
        assert_eq!(selected, "b");

        let state = manager.instance_state("a").await.unwrap();
        assert_eq!(state.status, InstanceStatus::RateLimited);
        assert!(state.rate_limited_until.is_some());
    }

    #[tokio::test]
    async fn no_matching_model_is_an_instance_error() {
        let manager = manager(vec![instance("a", 1)], RoutingStrategy::Failover);
        let err = manager
            .select_instance("gpt-4o", 0, None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code, 503);
        assert_eq!(err.kind, crate::error::ErrorKind::Instance);
    }

    #[tokio::test]
    async fn denied_admission_removes_instance_from_eligibility() {
        let mut a = instance("a", 1);
        a.max_tpm = 100;
        let manager = manager(vec![a, instance("b", 2)], RoutingStrategy::Failover);

        manager
            .rate_limiter("a")
            .await
            .unwrap()
            .update_usage(95)
            .await
            .unwrap();

        let selected = manager.select_instance("gpt-4", 10, None).await.unwrap();
        assert_eq!(selected, "b");
    }

    #[tokio::test]
    async fn success_accounting_updates_state_and_usage_log() {
        let manager = manager(vec![instance("a", 1)], RoutingStrategy::Failover);
        manager.record_success("a", 120, 42.0).await;

        let state = manager.instance_state("a").await.unwrap();
        assert_eq!(state.total_requests, 1);
        assert_eq!(state.successful_requests, 1);
        assert_eq!(state.total_tokens_served, 120);
        assert_eq!(state.avg_latency_ms, Some(42.0));

        let samples = manager.usage_samples("a", 60).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].1, 120);
    }

    #[tokio::test]
    async fn reset_is_idempotent() {
        let manager = manager(vec![instance("a", 1)], RoutingStrategy::Failover);
        manager.record_success("a", 120, 42.0).await;

        manager.reset_instance("a").await.unwrap();
        let state = manager.instance_state("a").await.unwrap();
        assert_eq!(state.total_requests, 0);

        // Second reset on a clean instance is a no-op.
        manager.reset_instance("a").await.unwrap();
        let state = manager.instance_state("a").await.unwrap();
        assert_eq!(state.total_requests, 0);
    }

    #[tokio::test]
    async fn admin_update_rejects_unknown_fields_and_applies_limits() {
        let manager = manager(vec![instance("a", 1)], RoutingStrategy::Failover);

        let err = manager
            .update_instance_config("a", json!({"api_key": "steal"}).as_object().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.status_code, 400);

        let updated = manager
            .update_instance_config(
                "a",
                json!({"max_tpm": 500, "weight": 3}).as_object().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(updated.max_tpm, 500);
        assert_eq!(updated.weight, 3);

        let limiter = manager.rate_limiter("a").await.unwrap();
        assert_eq!(limiter.limits(), (500, 0));
    }

    #[tokio::test]
    async fn fleet_stats_counts_health_and_totals() {
        let manager = manager(
            vec![instance("a", 1), instance("b", 2)],
            RoutingStrategy::Failover,
        );
        manager.record_success("a", 100, 10.0).await;
        for _ in 0..11 {
            manager
                .record_error("b", 500, ErrorOrigin::Upstream, "boom", 0)
                .await;
        }

        let stats = manager.fleet_stats().await.unwrap();
        assert_eq!(stats.total_instances, 2);
        assert_eq!(stats.healthy_instances, 1);
        assert_eq!(stats.total_requests, 12);
        assert_eq!(stats.total_tokens, 100);
    }
}
