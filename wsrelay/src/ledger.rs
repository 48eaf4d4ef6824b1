//! Durable record of which messages still await acknowledgment.
//!
//! One key per message under `{ns}::msg::{id}`. An entry exists while the
//! message is unacknowledged; its absence means the message is done. Retry
//! attempts check the ledger first, so an ack that lands between two attempts
//! stops further sends.

use std::sync::Arc;

use crate::ids::MessageId;
use crate::store::{Keyspace, Result, Store};

const PENDING: &str = "w";
const EXHAUSTED: &str = "x";

/// Stored state of an unacknowledged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Waiting for the peer to acknowledge; retries continue.
    Pending,
    /// Retry budget spent without an acknowledgment.
    Exhausted,
}

impl DeliveryState {
    fn as_str(self) -> &'static str {
        match self {
            DeliveryState::Pending => PENDING,
            DeliveryState::Exhausted => EXHAUSTED,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            PENDING => Some(DeliveryState::Pending),
            EXHAUSTED => Some(DeliveryState::Exhausted),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct DeliveryLedger {
    store: Arc<dyn Store>,
    keys: Keyspace,
}

impl DeliveryLedger {
    pub fn new(store: Arc<dyn Store>, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    pub async fn mark_pending(&self, id: &MessageId) -> Result<()> {
        self.store
            .set(&self.keys.message(id.as_str()), DeliveryState::Pending.as_str())
            .await
    }

    /// Acknowledge. Idempotent, and also ends an exhausted entry.
    pub async fn mark_done(&self, id: &MessageId) -> Result<()> {
        self.store.del(&[self.keys.message(id.as_str())]).await?;
        Ok(())
    }

    /// Record that retries ran out. A message acknowledged in the meantime
    /// stays done. Returns whether an entry was updated.
    pub async fn mark_exhausted(&self, id: &MessageId) -> Result<bool> {
        self.store
            .set_if_exists(
                &self.keys.message(id.as_str()),
                DeliveryState::Exhausted.as_str(),
            )
            .await
    }

    pub async fn is_done(&self, id: &MessageId) -> Result<bool> {
        Ok(self.state(id).await?.is_none())
    }

    /// `None` once acknowledged.
    pub async fn state(&self, id: &MessageId) -> Result<Option<DeliveryState>> {
        let raw = self.store.get(&self.keys.message(id.as_str())).await?;
        Ok(raw.as_deref().and_then(DeliveryState::parse))
    }

    /// Every unacknowledged message, pending or exhausted.
    pub async fn list_pending(&self) -> Result<Vec<MessageId>> {
        let prefix = self.keys.message_prefix();
        let mut ids: Vec<MessageId> = self
            .store
            .keys(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(MessageId::from))
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub async fn list_exhausted(&self) -> Result<Vec<MessageId>> {
        let mut exhausted = Vec::new();
        for id in self.list_pending().await? {
            if self.state(&id).await? == Some(DeliveryState::Exhausted) {
                exhausted.push(id);
            }
        }
        Ok(exhausted)
    }

    pub async fn clear_all(&self) -> Result<()> {
        let keys = self.store.keys(&self.keys.message_prefix()).await?;
        if !keys.is_empty() {
            self.store.del(&keys).await?;
        }
        Ok(())
    }
}
