//! Token-per-minute admission control over a shared sorted-set window.
//! Admission is read-then-compare, not CAS: concurrent deciders can
//! transiently over-admit `max_tpm`, which the upstream's own 429 bounds.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{unix_now, unix_now_nanos, StoreError};
use crate::store::{member_tokens, rate_limit_key, WindowStore};

pub const WINDOW_SECONDS: i64 = 60;

/// Extra TTL past the window so an idle key still expires on its own.
const KEY_TTL_SLACK_SECONDS: i64 = 60;

#[derive(Clone, Copy, Debug)]
struct Limits {
    max_tpm: u64,
    max_input_tokens: u64,
}

pub struct RateLimiter {
    instance: String,
    key: String,
    limits: std::sync::RwLock<Limits>,
    store: Arc<dyn WindowStore>,
}

#[derive(Clone, Debug, Serialize)]
pub struct UsageStats {
    pub total_tokens: u64,
    pub total_requests: u64,
    pub tokens_per_minute: u64,
    pub max_input_tokens: u64,
    pub utilization_percent: f64,
    pub window_seconds: i64,
    pub time_slots: BTreeMap<i64, u64>,
    pub cutoff_time: i64,
    pub current_time: i64,
}

impl RateLimiter {
    pub fn new(
        instance: impl Into<String>,
        max_tpm: u64,
        max_input_tokens: u64,
        store: Arc<dyn WindowStore>,
    ) -> Self {
        let instance = instance.into();
        Self {
            key: rate_limit_key(&instance),
            instance,
            limits: std::sync::RwLock::new(Limits {
                max_tpm,
                max_input_tokens,
            }),
            store,
        }
    }

    /// Returns `(admitted, retry_after_seconds)`.
    ///
    /// Fails open: a coordination-store error on this path admits the
    /// request, trading correctness for availability on the hot path.
    pub async fn check_capacity(&self, tokens: u64) -> (bool, u64) {
        let limits = *self.limits.read().expect("limits");

        if limits.max_input_tokens > 0 && tokens > limits.max_input_tokens {
            return (false, WINDOW_SECONDS as u64);
        }

        let now = unix_now();
        let cutoff = now - WINDOW_SECONDS;

        let entries = match self.store.evict_and_range(&self.key, cutoff).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(
                    instance = %self.instance,
                    error = %err,
                    "rate limit check failed, admitting"
                );
                return (true, 0);
            }
        };

        let mut current: u64 = 0;
        let mut oldest = now;
        for (member, score) in &entries {
            let Some(count) = member_tokens(member) else {
                continue;
            };
            current += count;
            if *score < oldest {
                oldest = *score;
            }
        }

        if current + tokens > limits.max_tpm {
            let retry_after = (oldest - cutoff).max(1) as u64;
            return (false, retry_after);
        }

        (true, 0)
    }

    /// Records consumed tokens. Fails closed: errors surface so callers can
    /// log them, but the request itself has already completed.
    pub async fn update_usage(&self, tokens: u64) -> Result<(), StoreError> {
        let now = unix_now();
        let member = format!("{tokens}:{}", unix_now_nanos());
        self.store
            .record(
                &self.key,
                &member,
                now,
                now - WINDOW_SECONDS,
                WINDOW_SECONDS + KEY_TTL_SLACK_SECONDS,
            )
            .await
    }

    pub async fn reset(&self) -> Result<(), StoreError> {
        self.store.del(&self.key).await
    }

    pub async fn usage_stats(&self) -> Result<UsageStats, StoreError> {
        let now = unix_now();
        let cutoff = now - WINDOW_SECONDS;
        let entries = self.store.evict_and_range(&self.key, cutoff).await?;
        let limits = *self.limits.read().expect("limits");

        let mut total_tokens: u64 = 0;
        let mut time_slots: BTreeMap<i64, u64> = BTreeMap::new();
        for (member, score) in &entries {
            let Some(count) = member_tokens(member) else {
                continue;
            };
            total_tokens += count;
            *time_slots.entry(score / 10 * 10).or_insert(0) += count;
        }

        let utilization_percent = if limits.max_tpm == 0 {
            0.0
        } else {
            total_tokens as f64 / limits.max_tpm as f64 * 100.0
        };

        Ok(UsageStats {
            total_tokens,
            total_requests: entries.len() as u64,
            tokens_per_minute: limits.max_tpm,
            max_input_tokens: limits.max_input_tokens,
            utilization_percent,
            window_seconds: WINDOW_SECONDS,
            time_slots,
            cutoff_time: cutoff,
            current_time: now,
        })
    }

    /// Admin reconfiguration path; takes effect on the next admission.
    pub fn set_limits(&self, max_tpm: u64, max_input_tokens: u64) {
        let mut limits = self.limits.write().expect("limits");
        limits.max_tpm = max_tpm;
        limits.max_input_tokens = max_input_tokens;
    }

    pub fn limits(&self) -> (u64, u64) {
        let limits = *self.limits.read().expect("limits");
        (limits.max_tpm, limits.max_input_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    use async_trait::async_trait;

    fn limiter(max_tpm: u64, max_input: u64) -> (RateLimiter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new("azure-east", max_tpm, max_input, store.clone());
        (limiter, store)
    }

    #[tokio::test]
    async fn admits_when_window_has_capacity() {
        let (limiter, _) = limiter(60_000, 0);
        let (admitted, retry_after) = limiter.check_capacity(10).await;
        assert!(admitted);
        assert_eq!(retry_after, 0);
    }

    #[tokio::test]
    async fn denies_with_retry_after_from_oldest_entry() {
        let (limiter, store) = limiter(100, 0);
        let now = unix_now();
        store
            .zadd(&rate_limit_key("azure-east"), "90:1", now - 10)
            .await
            .unwrap();

        let (admitted, retry_after) = limiter.check_capacity(20).await;
        assert!(!admitted);
        // Oldest entry leaves the window in ~50s; allow a second of skew.
        assert!((49..=51).contains(&retry_after), "retry_after={retry_after}");
    }

    #[tokio::test]
    async fn denial_on_empty_window_waits_a_full_window() {
        let (limiter, _) = limiter(10, 0);
        let (admitted, retry_after) = limiter.check_capacity(20).await;
        assert!(!admitted);
        assert_eq!(retry_after, WINDOW_SECONDS as u64);
    }

    #[tokio::test]
    async fn every_denial_carries_a_positive_retry_after() {
        let (limiter, store) = limiter(100, 0);
        let now = unix_now();
        // An entry right at the window edge would otherwise round to zero.
        store
            .zadd(&rate_limit_key("azure-east"), "100:1", now - WINDOW_SECONDS + 1)
            .await
            .unwrap();

        let (admitted, retry_after) = limiter.check_capacity(50).await;
        assert!(!admitted);
        assert!(retry_after >= 1);
    }

    #[tokio::test]
    async fn input_cap_denies_regardless_of_window_state() {
        let (limiter, _) = limiter(1_000_000, 4_000);
        let (admitted, retry_after) = limiter.check_capacity(4_001).await;
        assert!(!admitted);
        assert_eq!(retry_after, 60);

        let (admitted, _) = limiter.check_capacity(4_000).await;
        assert!(admitted);
    }

    #[tokio::test]
    async fn usage_updates_accumulate_and_reset_clears() {
        let (limiter, _) = limiter(100, 0);
        limiter.update_usage(60).await.unwrap();
        limiter.update_usage(30).await.unwrap();

        let (admitted, _) = limiter.check_capacity(20).await;
        assert!(!admitted);

        let stats = limiter.usage_stats().await.unwrap();
        assert_eq!(stats.total_tokens, 90);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.tokens_per_minute, 100);
        assert!((stats.utilization_percent - 90.0).abs() < f64::EPSILON);

        limiter.reset().await.unwrap();
        let (admitted, _) = limiter.check_capacity(20).await;
        assert!(admitted);

        // A second reset on a clean window is a no-op.
        limiter.reset().await.unwrap();
        let stats = limiter.usage_stats().await.unwrap();
        assert_eq!(stats.total_tokens, 0);
    }

    struct FailingStore;

    #[async_trait]
    impl WindowStore for FailingStore {
        async fn zadd(&self, _: &str, _: &str, _: i64) -> Result<(), StoreError> {
            Err(broken())
        }
        async fn zrange_with_scores(&self, _: &str) -> Result<Vec<(String, i64)>, StoreError> {
            Err(broken())
        }
        async fn zrem_range_by_score(&self, _: &str, _: i64) -> Result<(), StoreError> {
            Err(broken())
        }
        async fn del(&self, _: &str) -> Result<(), StoreError> {
            Err(broken())
        }
        async fn expire(&self, _: &str, _: i64) -> Result<(), StoreError> {
            Err(broken())
        }
        async fn evict_and_range(&self, _: &str, _: i64) -> Result<Vec<(String, i64)>, StoreError> {
            Err(broken())
        }
        async fn record(&self, _: &str, _: &str, _: i64, _: i64, _: i64) -> Result<(), StoreError> {
            Err(broken())
        }
    }

    fn broken() -> StoreError {
        StoreError::Redis(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        )))
    }

    #[tokio::test]
    async fn admission_fails_open_on_store_errors() {
        let limiter = RateLimiter::new("azure-east", 1, 0, Arc::new(FailingStore));
        let (admitted, retry_after) = limiter.check_capacity(1_000_000).await;
        assert!(admitted);
        assert_eq!(retry_after, 0);
    }

    #[tokio::test]
    async fn usage_recording_fails_closed() {
        let limiter = RateLimiter::new("azure-east", 1, 0, Arc::new(FailingStore));
        assert!(limiter.update_usage(10).await.is_err());
    }

    #[tokio::test]
    async fn set_limits_applies_to_subsequent_checks() {
        let (limiter, _) = limiter(100, 0);
        limiter.update_usage(90).await.unwrap();

        let (admitted, _) = limiter.check_capacity(20).await;
        assert!(!admitted);

        limiter.set_limits(200, 0);
        let (admitted, _) = limiter.check_capacity(20).await;
        assert!(admitted);
        assert_eq!(limiter.limits(), (200, 0));
    }
}
