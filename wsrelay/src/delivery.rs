//! Guaranteed delivery: at-least-once sends driven by the retry queue.
//!
//! ```text
//! register_send ──► ledger: Pending ──► queue job
//!                                          │ each attempt
//!                                          ▼
//!                            ledger done? ── yes ──► Completed
//!                                │ no
//!                                ▼
//!                   transmit Request frame, fail attempt
//!                                │ budget spent
//!                                ▼
//!                        ledger: Exhausted
//! ```
//!
//! An attempt never succeeds on the strength of a write alone. Only an
//! acknowledgment (a Response frame, recorded with `acknowledge`) ends
//! retries, and it is observed by the next attempt.

use async_trait::async_trait;
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::ids::{ConnectionId, MessageId};
use crate::ledger::DeliveryLedger;
use crate::protocol::Frame;
use crate::queue::{Job, JobEvent, JobFailure, JobHandler, JobQueue, QueueConfig, RetryPolicy};
use crate::rooms::RoomStore;
use crate::store::{Keyspace, Store};
use crate::subscriptions::SubscriptionStore;

const QUEUE_NAME: &str = "sendings";

/// Path from the engine to connected peers.
#[async_trait]
pub trait Transmit: Send + Sync + 'static {
    /// Write an encoded frame to `target`, wherever it is connected.
    async fn transmit(&self, target: &ConnectionId, text: &str) -> Result<()>;

    /// Every connection a broadcast should consider.
    async fn targets(&self) -> Result<Vec<ConnectionId>>;
}

/// Queue payload for one message to one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSend {
    pub message_id: MessageId,
    pub connection_id: ConnectionId,
    pub event: String,
    pub payload: Value,
}

struct Attempt {
    ledger: DeliveryLedger,
    transmit: Arc<dyn Transmit>,
}

#[async_trait]
impl JobHandler<PendingSend> for Attempt {
    async fn process(&self, job: &Job<PendingSend>) -> std::result::Result<(), JobFailure> {
        let send = &job.data;
        let done = self
            .ledger
            .is_done(&send.message_id)
            .await
            .map_err(|e| JobFailure::new(e.to_string()))?;
        if done {
            return Ok(());
        }

        let frame = Frame::request(send.message_id.clone(), send.event.clone(), send.payload.clone());
        match frame.encode() {
            Ok(text) => {
                if let Err(e) = self.transmit.transmit(&send.connection_id, &text).await {
                    log::warn!("Transmit of {} to {} failed: {e}", send.message_id, send.connection_id);
                }
            }
            Err(e) => log::warn!("Cannot encode {}: {e}", send.message_id),
        }

        Err(JobFailure::new("not yet acknowledged"))
    }

    async fn exhausted(&self, job: &Job<PendingSend>) {
        let send = &job.data;
        match self.ledger.mark_exhausted(&send.message_id).await {
            Ok(true) => log::error!(
                "Delivery of {} ({}) to {} exhausted after {} attempts",
                send.message_id,
                send.event,
                send.connection_id,
                job.attempts_made
            ),
            Ok(false) => log::debug!("{} acknowledged before exhaustion", send.message_id),
            Err(e) => log::error!("Cannot mark {} exhausted: {e}", send.message_id),
        }
    }
}

pub struct DeliveryEngine {
    ledger: DeliveryLedger,
    queue: JobQueue<PendingSend>,
    subscriptions: SubscriptionStore,
    rooms: RoomStore,
    transmit: Arc<dyn Transmit>,
    retry: RetryPolicy,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<dyn Store>,
        keys: &Keyspace,
        transmit: Arc<dyn Transmit>,
        retry: RetryPolicy,
        queue: QueueConfig,
    ) -> Self {
        Self {
            ledger: DeliveryLedger::new(store.clone(), keys.clone()),
            queue: JobQueue::new(QUEUE_NAME, store.clone(), keys, queue),
            subscriptions: SubscriptionStore::new(store.clone(), keys.clone()),
            rooms: RoomStore::new(store, keys.clone()),
            transmit,
            retry,
        }
    }

    /// Start working the shared queue from this process.
    pub async fn start(&self) {
        self.queue
            .process(Attempt {
                ledger: self.ledger.clone(),
                transmit: self.transmit.clone(),
            })
            .await;
    }

    /// Record a message as pending and queue its first attempt.
    pub async fn register_send(
        &self,
        target: &ConnectionId,
        event: &str,
        payload: Value,
    ) -> Result<MessageId> {
        let message_id = MessageId::generate();
        self.ledger.mark_pending(&message_id).await?;

        let send = PendingSend {
            message_id: message_id.clone(),
            connection_id: target.clone(),
            event: event.to_string(),
            payload,
        };
        if let Err(e) = self.queue.enqueue(send, self.retry).await {
            // Nothing will ever retry it, so do not leave it counted
            let _ = self.ledger.mark_done(&message_id).await;
            return Err(e.into());
        }
        log::info!("send {event} -> {target} ({message_id})");
        Ok(message_id)
    }

    /// Idempotent; a late ack also clears an exhausted entry.
    pub async fn acknowledge(&self, id: &MessageId) -> Result<()> {
        self.ledger.mark_done(id).await?;
        log::debug!("ack {id}");
        Ok(())
    }

    /// Send to every connection subscribed to `event`.
    pub async fn broadcast(&self, event: &str, payload: Value) -> Result<Vec<MessageId>> {
        let targets = self.transmit.targets().await?;
        self.send_to_subscribed(targets, event, payload).await
    }

    /// Send to every member of `room` subscribed to `event`.
    pub async fn send_to_room(&self, room: &str, event: &str, payload: Value) -> Result<Vec<MessageId>> {
        let members = self.rooms.get_members(room).await?;
        if members.is_empty() {
            log::warn!("No members in room {room}");
        }
        self.send_to_subscribed(members, event, payload).await
    }

    async fn send_to_subscribed(
        &self,
        targets: Vec<ConnectionId>,
        event: &str,
        payload: Value,
    ) -> Result<Vec<MessageId>> {
        let subscribed = try_join_all(targets.iter().map(|id| async move {
            let yes = self.subscriptions.has_subscription(id, event).await?;
            Ok::<_, crate::error::RelayError>(yes.then_some(id))
        }))
        .await?;

        try_join_all(
            subscribed
                .into_iter()
                .flatten()
                .map(|id| self.register_send(id, event, payload.clone())),
        )
        .await
    }

    /// Unacknowledged messages, exhausted ones included.
    pub async fn remaining_count(&self) -> Result<usize> {
        Ok(self.ledger.list_pending().await?.len())
    }

    pub async fn pending_ids(&self) -> Result<Vec<MessageId>> {
        Ok(self.ledger.list_pending().await?)
    }

    pub async fn exhausted_ids(&self) -> Result<Vec<MessageId>> {
        Ok(self.ledger.list_exhausted().await?)
    }

    /// Forget every unacknowledged message and drop queued attempts.
    pub async fn clear(&self) -> Result<()> {
        self.queue.empty().await?;
        self.ledger.clear_all().await?;
        Ok(())
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.queue.subscribe_events()
    }

    pub fn ledger(&self) -> &DeliveryLedger {
        &self.ledger
    }

    /// Stop this process's workers; queued attempts remain in the store.
    pub async fn close(&self) {
        self.queue.close().await;
    }
}
