//! Cluster-wide connection directory and fan-out.
//!
//! ```text
//! send(C, bytes) ──► publish {id: C, data} on {ns}::conn_channel
//!                         │
//!        ┌────────────────┼────────────────┐
//!        ▼                ▼                ▼
//!   process A        process B        process C
//!   C local? no      C local? yes     C local? no
//!   (ignore)         write to socket  (ignore)
//! ```
//!
//! No process records which process owns which connection: every process
//! sees every envelope and keeps the ones it can deliver. Envelopes are
//! queued on the socket in the order they were published.
//!
//! If the subscription ends (the store dropped its pub/sub connection) the
//! listener resubscribes after `RESUBSCRIBE_DELAY` until it succeeds.

use async_trait::async_trait;
use log::{error, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::delivery::Transmit;
use crate::error::Result;
use crate::ids::ConnectionId;
use crate::registry::LocalRegistry;
use crate::store::{ChannelReceiver, Keyspace, Store};

/// Wait between attempts to reattach a lost fan-out subscription.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(250);

/// Fan-out message: deliver `data` to connection `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    id: ConnectionId,
    data: String,
}

/// Durable set of every connection id plus the fan-out channel.
pub struct ConnectionDirectory {
    store: Arc<dyn Store>,
    keys: Keyspace,
    registry: LocalRegistry,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionDirectory {
    pub fn new(store: Arc<dyn Store>, keys: Keyspace, registry: LocalRegistry) -> Self {
        Self {
            store,
            keys,
            registry,
            listener: Mutex::new(None),
        }
    }

    /// Subscribe to the fan-out channel and deliver envelopes whose target
    /// lives in this process.
    pub async fn start(&self) -> Result<()> {
        let channel = self.keys.connection_channel();
        let rx = self.store.subscribe(&channel).await?;
        let handle = tokio::spawn(listen(
            self.store.clone(),
            channel.clone(),
            self.registry.clone(),
            rx,
        ));

        if let Some(old) = self.listener.lock().await.replace(handle) {
            old.abort();
        }
        info!("Fan-out listener attached to {channel}");
        Ok(())
    }

    pub async fn add(&self, id: &ConnectionId) -> Result<()> {
        self.store.sadd(&self.keys.connections(), id.as_str()).await?;
        Ok(())
    }

    /// Idempotent.
    pub async fn remove(&self, id: &ConnectionId) -> Result<()> {
        self.store.srem(&self.keys.connections(), id.as_str()).await?;
        Ok(())
    }

    /// Every connection id across all processes.
    pub async fn all_ids(&self) -> Result<Vec<ConnectionId>> {
        let ids = self.store.smembers(&self.keys.connections()).await?;
        Ok(ids.into_iter().map(ConnectionId::from).collect())
    }

    pub async fn contains(&self, id: &ConnectionId) -> Result<bool> {
        Ok(self
            .store
            .sismember(&self.keys.connections(), id.as_str())
            .await?)
    }

    /// Publish `text` for whichever process holds `id`.
    pub async fn send(&self, id: &ConnectionId, text: &str) -> Result<()> {
        let envelope = Envelope {
            id: id.clone(),
            data: text.to_string(),
        };
        let payload = serde_json::to_string(&envelope)?;
        self.store
            .publish(&self.keys.connection_channel(), &payload)
            .await?;
        Ok(())
    }

    /// Stop listening. Durable membership is left to the close handlers.
    pub async fn close(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
    }

    pub fn registry(&self) -> &LocalRegistry {
        &self.registry
    }
}

impl Drop for ConnectionDirectory {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

async fn listen(
    store: Arc<dyn Store>,
    channel: String,
    registry: LocalRegistry,
    mut rx: ChannelReceiver,
) {
    loop {
        while let Some(raw) = rx.recv().await {
            deliver(&registry, &raw).await;
        }
        error!("Fan-out subscription to {channel} lost, resubscribing");
        rx = loop {
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            match store.subscribe(&channel).await {
                Ok(rx) => break rx,
                Err(e) => error!("Resubscribing to {channel} failed: {e}"),
            }
        };
        info!("Fan-out listener reattached to {channel}");
    }
}

async fn deliver(registry: &LocalRegistry, raw: &str) {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(e) => e,
        Err(e) => {
            warn!("Dropping malformed fan-out envelope: {e}");
            return;
        }
    };
    if !registry.contains(&envelope.id).await {
        trace!("Connection {} not held here", envelope.id);
        return;
    }
    // Queued only; the write completes on the connection's own task
    if let Err(e) = registry.post(&envelope.id, envelope.data).await {
        warn!("Local delivery to {} failed: {e}", envelope.id);
    }
}

#[async_trait]
impl Transmit for ConnectionDirectory {
    async fn transmit(&self, target: &ConnectionId, text: &str) -> Result<()> {
        self.send(target, text).await
    }

    async fn targets(&self) -> Result<Vec<ConnectionId>> {
        self.all_ids().await
    }
}
