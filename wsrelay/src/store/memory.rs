//! In-process store.
//!
//! Clones share the same state, so several `RelayServer`s built on clones of
//! one `MemoryStore` behave like processes attached to one Redis.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use super::{ChannelReceiver, Result, Store};

#[derive(Default)]
struct Inner {
    values: HashMap<String, String>,
    sets: HashMap<String, HashSet<String>>,
    sorted: HashMap<String, HashMap<String, i64>>,
    channels: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

/// Shared in-memory store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on a channel.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        let inner = self.inner.read().await;
        inner
            .channels
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|s| !s.is_closed()).count())
    }

    /// End every subscription on `channel`, the way a dropped Redis pub/sub
    /// connection would. Receivers see their stream end.
    pub async fn disconnect_subscribers(&self, channel: &str) {
        self.inner.write().await.channels.remove(channel);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.read().await.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_if_exists(&self, key: &str, value: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.values.get_mut(key) {
            Some(slot) => {
                *slot = value.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut removed = 0u64;
        for key in keys {
            let existed = inner.values.remove(key).is_some()
                | inner.sets.remove(key).is_some()
                | inner.sorted.remove(key).is_some();
            if existed {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        let mut keys: Vec<String> = inner
            .values
            .keys()
            .chain(inner.sets.keys())
            .chain(inner.sorted.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(set) = inner.sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        // Empty sets disappear, as in Redis
        if set.is_empty() {
            inner.sets.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .sorted
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        let Some(zset) = inner.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let mut due: Vec<(&String, i64)> = zset
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .map(|(m, s)| (m, *s))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(due.into_iter().take(limit).map(|(m, _)| m.clone()).collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(zset) = inner.sorted.get_mut(key) else {
            return Ok(false);
        };
        let removed = zset.remove(member).is_some();
        if zset.is_empty() {
            inner.sorted.remove(key);
        }
        Ok(removed)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(subs) = inner.channels.get_mut(channel) {
            subs.retain(|tx| tx.send(payload.to_string()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<ChannelReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .write()
            .await
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
