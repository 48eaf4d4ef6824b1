//! Shared state substrate.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   ┌─────────────┐
//! │ RelayServer │   │ RelayServer │      (one per process)
//! └──────┬──────┘   └──────┬──────┘
//!        │  Arc<dyn Store> │
//!        ▼                 ▼
//! ┌──────────────────────────────────────────────┐
//! │ {ns}::conn            set   connection ids    │
//! │ {ns}::conn_channel    chan  fan-out envelopes │
//! │ {ns}::listen::{id}    set   subscriptions     │
//! │ {ns}::room::{room}    set   room members      │
//! │ {ns}::id_room::{id}   set   rooms of a conn   │
//! │ {ns}::msg::{id}       kv    delivery ledger   │
//! │ {ns}::queue::{q}::*   zset  retry jobs        │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Every mutation is a single atomic primitive, so processes sharing a store
//! never need a cross-operation transaction or a local lock.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Receiving end of a pub/sub channel subscription.
pub type ChannelReceiver = mpsc::UnboundedReceiver<String>;

/// Store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend unreachable or connection dropped
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Backend rejected the command
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Key-value, set, sorted-set and pub/sub primitives.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Overwrite `key` only if it already exists. Returns whether it did.
    async fn set_if_exists(&self, key: &str, value: &str) -> Result<bool>;

    /// Delete keys of any type. Returns how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// All keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Returns true if the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Returns true if the member was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()>;

    /// Members scored at most `max_score`, lowest first.
    async fn zrange_by_score(&self, key: &str, max_score: i64, limit: usize)
        -> Result<Vec<String>>;

    /// Returns true if the member was present. Used to claim work: exactly one
    /// caller observes `true` for a given member.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<ChannelReceiver>;
}

/// Builds every key used by the relay under one namespace.
#[derive(Debug, Clone)]
pub struct Keyspace {
    namespace: String,
}

impl Keyspace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn connections(&self) -> String {
        format!("{}::conn", self.namespace)
    }

    pub fn connection_channel(&self) -> String {
        format!("{}::conn_channel", self.namespace)
    }

    pub fn subscriptions(&self, conn_id: &str) -> String {
        format!("{}::listen::{}", self.namespace, conn_id)
    }

    pub fn subscriptions_prefix(&self) -> String {
        format!("{}::listen::", self.namespace)
    }

    pub fn room(&self, room: &str) -> String {
        format!("{}::room::{}", self.namespace, room)
    }

    pub fn room_prefix(&self) -> String {
        format!("{}::room::", self.namespace)
    }

    pub fn rooms_of(&self, conn_id: &str) -> String {
        format!("{}::id_room::{}", self.namespace, conn_id)
    }

    pub fn rooms_of_prefix(&self) -> String {
        format!("{}::id_room::", self.namespace)
    }

    pub fn message(&self, message_id: &str) -> String {
        format!("{}{}", self.message_prefix(), message_id)
    }

    pub fn message_prefix(&self) -> String {
        format!("{}::msg::", self.namespace)
    }

    pub fn queue_delayed(&self, queue: &str) -> String {
        format!("{}::queue::{}::delayed", self.namespace, queue)
    }

    pub fn queue_active(&self, queue: &str) -> String {
        format!("{}::queue::{}::active", self.namespace, queue)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("wsrelay")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_layout() {
        let ks = Keyspace::new("ns");
        assert_eq!(ks.connections(), "ns::conn");
        assert_eq!(ks.subscriptions("c1"), "ns::listen::c1");
        assert_eq!(ks.room("lobby"), "ns::room::lobby");
        assert_eq!(ks.rooms_of("c1"), "ns::id_room::c1");
        assert_eq!(ks.message("m1"), "ns::msg::m1");
        assert!(ks.message("m1").starts_with(&ks.message_prefix()));
        assert_eq!(ks.queue_delayed("sendings"), "ns::queue::sendings::delayed");
    }

    #[test]
    fn test_rooms_prefix_does_not_cover_reverse_index() {
        let ks = Keyspace::default();
        assert!(!ks.rooms_of("c1").starts_with(&ks.room_prefix()));
    }
}
