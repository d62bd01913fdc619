//! Coordination-store capability traits. All cross-replica truth (rate
//! windows, state blobs, usage logs) lives behind these; the per-process
//! registries cache factories, never decisions.

mod memory_store;
mod redis_store;

pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::state::InstanceState;

pub const STATE_KEY_PREFIX: &str = "proxy:instance:state:";
pub const RATE_LIMIT_KEY_PREFIX: &str = "instance:rate_limit:window:";
pub const USAGE_LOG_KEY_PREFIX: &str = "proxy:usage:window:";

/// Instance state blobs expire after a day without writes.
pub const STATE_TTL_SECONDS: u64 = 24 * 60 * 60;

/// The longer-horizon usage log outlives its 24h read window slightly.
pub const USAGE_LOG_RETENTION_SECONDS: i64 = 24 * 60 * 60;
pub const USAGE_LOG_TTL_SECONDS: i64 = 25 * 60 * 60;

pub fn state_key(name: &str) -> String {
    format!("{STATE_KEY_PREFIX}{name}")
}

pub fn rate_limit_key(name: &str) -> String {
    format!("{RATE_LIMIT_KEY_PREFIX}{name}")
}

pub fn usage_log_key(name: &str) -> String {
    format!("{USAGE_LOG_KEY_PREFIX}{name}")
}

/// Durable per-instance state snapshots.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Missing keys yield a fresh identity-only state, not an error.
    async fn get(&self, name: &str) -> Result<InstanceState, StoreError>;
    async fn set(&self, name: &str, state: &InstanceState) -> Result<(), StoreError>;
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<String>, StoreError>;
    async fn get_all(&self) -> Result<HashMap<String, InstanceState>, StoreError>;
}

/// Sorted-set windows: score = unix seconds, member = `"<tokens>:<nanos>"`.
#[async_trait]
pub trait WindowStore: Send + Sync {
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError>;
    /// All entries, ascending by score, as (member, score).
    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, i64)>, StoreError>;
    /// Removes entries with score ≤ `max_score`.
    async fn zrem_range_by_score(&self, key: &str, max_score: i64) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    async fn expire(&self, key: &str, ttl_seconds: i64) -> Result<(), StoreError>;

    /// Pipelined evict-then-read used on the admission hot path.
    async fn evict_and_range(
        &self,
        key: &str,
        cutoff: i64,
    ) -> Result<Vec<(String, i64)>, StoreError>;

    /// Pipelined add + evict + TTL refresh used when recording usage.
    async fn record(
        &self,
        key: &str,
        member: &str,
        score: i64,
        cutoff: i64,
        ttl_seconds: i64,
    ) -> Result<(), StoreError>;
}

/// Splits a window member back into its token count; the nanosecond suffix
/// only exists to keep members unique under bursts.
pub fn member_tokens(member: &str) -> Option<u64> {
    member.split(':').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_tokens_parses_token_prefix() {
        assert_eq!(member_tokens("1500:1722450000123456789"), Some(1500));
        assert_eq!(member_tokens("42"), Some(42));
        assert_eq!(member_tokens("garbage:1"), None);
    }
}
