use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{StateStore, WindowStore};
use crate::error::StoreError;
use crate::state::InstanceState;

/// In-process store with the same semantics as the Redis one. Used by the
/// test suites; also handy for single-replica deployments without Redis.
#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<String, InstanceState>>,
    windows: Mutex<HashMap<String, Vec<(String, i64)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<InstanceState, StoreError> {
        let states = self.states.lock().expect("state map");
        Ok(states
            .get(name)
            .cloned()
            .unwrap_or_else(|| InstanceState::new(name)))
    }

    async fn set(&self, name: &str, state: &InstanceState) -> Result<(), StoreError> {
        let mut states = self.states.lock().expect("state map");
        states.insert(name.to_string(), state.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut states = self.states.lock().expect("state map");
        states.remove(name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let states = self.states.lock().expect("state map");
        Ok(states.keys().cloned().collect())
    }

    async fn get_all(&self) -> Result<HashMap<String, InstanceState>, StoreError> {
        let states = self.states.lock().expect("state map");
        Ok(states.clone())
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut windows = self.windows.lock().expect("window map");
        let entries = windows.entry(key.to_string()).or_default();
        entries.push((member.to_string(), score));
        entries.sort_by_key(|(_, score)| *score);
        Ok(())
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, i64)>, StoreError> {
        let windows = self.windows.lock().expect("window map");
        Ok(windows.get(key).cloned().unwrap_or_default())
    }

    async fn zrem_range_by_score(&self, key: &str, max_score: i64) -> Result<(), StoreError> {
        let mut windows = self.windows.lock().expect("window map");
        if let Some(entries) = windows.get_mut(key) {
            entries.retain(|(_, score)| *score > max_score);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut windows = self.windows.lock().expect("window map");
        windows.remove(key);
        Ok(())
    }

    async fn expire(&self, _key: &str, _ttl_seconds: i64) -> Result<(), StoreError> {
        Ok(())
    }

    async fn evict_and_range(
        &self,
        key: &str,
        cutoff: i64,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let mut windows = self.windows.lock().expect("window map");
        match windows.get_mut(key) {
            Some(entries) => {
                entries.retain(|(_, score)| *score > cutoff);
                Ok(entries.clone())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn record(
        &self,
        key: &str,
        member: &str,
        score: i64,
        cutoff: i64,
        _ttl_seconds: i64,
    ) -> Result<(), StoreError> {
        let mut windows = self.windows.lock().expect("window map");
        let entries = windows.entry(key.to_string()).or_default();
        entries.push((member.to_string(), score));
        entries.retain(|(_, score)| *score > cutoff);
        entries.sort_by_key(|(_, score)| *score);
        Ok(())
    }
}
