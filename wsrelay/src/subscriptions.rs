//! Which application events each connection has declared interest in.
//!
//! Broadcast and room sends consult this store; direct sends do not.

use std::sync::Arc;

use crate::ids::ConnectionId;
use crate::store::{Keyspace, Result, Store};

/// Durable `connection -> {event}` sets under `{ns}::listen::{id}`.
#[derive(Clone)]
pub struct SubscriptionStore {
    store: Arc<dyn Store>,
    keys: Keyspace,
}

impl SubscriptionStore {
    pub fn new(store: Arc<dyn Store>, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    pub async fn add(&self, id: &ConnectionId, event: &str) -> Result<()> {
        self.store
            .sadd(&self.keys.subscriptions(id.as_str()), event)
            .await?;
        Ok(())
    }

    pub async fn remove(&self, id: &ConnectionId, event: &str) -> Result<()> {
        self.store
            .srem(&self.keys.subscriptions(id.as_str()), event)
            .await?;
        Ok(())
    }

    /// Drop every subscription of a connection. Idempotent.
    pub async fn remove_all(&self, id: &ConnectionId) -> Result<()> {
        self.store
            .del(&[self.keys.subscriptions(id.as_str())])
            .await?;
        Ok(())
    }

    pub async fn has_subscription(&self, id: &ConnectionId, event: &str) -> Result<bool> {
        self.store
            .sismember(&self.keys.subscriptions(id.as_str()), event)
            .await
    }

    pub async fn list_subscriptions(&self, id: &ConnectionId) -> Result<Vec<String>> {
        let mut events = self
            .store
            .smembers(&self.keys.subscriptions(id.as_str()))
            .await?;
        events.sort();
        Ok(events)
    }

    /// Remove every subscription in the namespace.
    pub async fn clear(&self) -> Result<()> {
        let keys = self.store.keys(&self.keys.subscriptions_prefix()).await?;
        if !keys.is_empty() {
            self.store.del(&keys).await?;
        }
        Ok(())
    }
}
