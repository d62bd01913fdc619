use std::collections::HashMap;

use async_trait::async_trait;
use redis::{AsyncCommands, IntoConnectionInfo};

use super::{state_key, StateStore, WindowStore, STATE_KEY_PREFIX, STATE_TTL_SECONDS};
use crate::error::StoreError;
use crate::state::InstanceState;

/// Redis-backed coordination store shared across proxy replicas. One client,
/// multiplexed connections.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>, password: &str) -> Result<Self, StoreError> {
        let mut info = url.as_ref().into_connection_info()?;
        if !password.is_empty() {
            info.redis.password = Some(password.to_string());
        }
        Ok(Self {
            client: redis::Client::open(info)?,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get("proxy:__ping__").await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, name: &str) -> Result<InstanceState, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(state_key(name)).await?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(InstanceState::new(name)),
        }
    }

    async fn set(&self, name: &str, state: &InstanceState) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let raw = serde_json::to_string(state)?;
        let _: () = conn.set_ex(state_key(name), raw, STATE_TTL_SECONDS).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(state_key(name)).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = conn.keys(format!("{STATE_KEY_PREFIX}*")).await?;
        Ok(keys
            .into_iter()
            .map(|key| key[STATE_KEY_PREFIX.len()..].to_string())
            .collect())
    }

    async fn get_all(&self) -> Result<HashMap<String, InstanceState>, StoreError> {
        let names = StateStore::list(self).await?;
        let mut states = HashMap::with_capacity(names.len());
        for name in names {
            // Skip unreadable entries, keep serving the rest.
            if let Ok(state) = StateStore::get(self, &name).await {
                states.insert(name, state);
            }
        }
        Ok(states)
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, i64)>, StoreError> {
        let mut conn = self.connection().await?;
        let entries: Vec<(String, i64)> = conn.zrange_withscores(key, 0, -1).await?;
        Ok(entries)
    }

    async fn zrem_range_by_score(&self, key: &str, max_score: i64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.zrembyscore(key, "-inf", max_score).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_seconds: i64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.expire(key, ttl_seconds).await?;
        Ok(())
    }

    async fn evict_and_range(
        &self,
        key: &str,
        cutoff: i64,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let mut conn = self.connection().await?;
        let (entries,): (Vec<(String, i64)>,) = redis::pipe()
            .zrembyscore(key, "-inf", cutoff)
            .ignore()
            .zrange_withscores(key, 0, -1)
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }

    async fn record(
        &self,
        key: &str,
        member: &str,
        score: i64,
        cutoff: i64,
        ttl_seconds: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = redis::pipe()
            .zadd(key, member, score)
            .ignore()
            .zrembyscore(key, "-inf", cutoff)
            .ignore()
            .expire(key, ttl_seconds)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
