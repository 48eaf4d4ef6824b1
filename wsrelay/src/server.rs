//! Relay server: accepts sockets and exposes the pub/sub surface.
//!
//! Architecture:
//! ```text
//! TcpListener ──► accept_async ──► LocalRegistry ──► Connection (reader/writer)
//!                                                        │ ControlEvent
//!                                                        ▼
//!                                                  control loop
//!                     ┌──────────────┬───────────────┬───┴──────────┬─────────────┐
//!                     ▼              ▼               ▼              ▼             ▼
//!                 Opened:        Response:       Declared:       Closed:      connection
//!                 directory.add  engine.ack      subscriptions   cleanup x3   notification
//!
//! send/broadcast/send_to_room ──► DeliveryEngine ──► queue ──► ConnectionDirectory
//!                                                               (fan-out channel)
//! ```
//!
//! Several servers may share one store. Each holds its own sockets; the
//! directory, subscriptions, rooms, ledger and queue are shared.

use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{Connection, ControlEvent, ControlSender};
use crate::delivery::DeliveryEngine;
use crate::directory::ConnectionDirectory;
use crate::error::Result;
use crate::ids::{ConnectionId, MessageId};
use crate::queue::{QueueConfig, RetryPolicy};
use crate::registry::LocalRegistry;
use crate::rooms::RoomStore;
use crate::store::{Keyspace, Store};
use crate::subscriptions::SubscriptionStore;

/// How long `close` waits for local sockets to finish their close handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Prefix for every store key; servers sharing it form one cluster
    pub namespace: String,
    /// Attempt budget for each sent message
    pub retry: RetryPolicy,
    pub queue: QueueConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            namespace: "wsrelay".to_string(),
            retry: RetryPolicy::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port on loopback.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Self::default()
        }
    }
}

/// Shared pieces the control loop needs.
#[derive(Clone)]
struct Control {
    registry: LocalRegistry,
    directory: Arc<ConnectionDirectory>,
    subscriptions: SubscriptionStore,
    rooms: RoomStore,
    engine: Arc<DeliveryEngine>,
    connections: mpsc::UnboundedSender<Connection>,
}

impl Control {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<ControlEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ControlEvent::Opened(conn) => {
                    if let Err(e) = self.directory.add(conn.id()).await {
                        log::error!("Failed to register {} in directory: {e}", conn.id());
                    }
                    log::info!("Connection {} opened", conn.id());
                    let _ = self.connections.send(conn);
                }
                ControlEvent::Response { conn_id, req_id, event } => {
                    log::debug!("Response for {req_id} ({event}) from {conn_id}");
                    if let Err(e) = self.engine.acknowledge(&req_id).await {
                        log::error!("Failed to acknowledge {req_id}: {e}");
                    }
                }
                ControlEvent::SubscriptionDeclared { conn_id, event } => {
                    log::debug!("{conn_id} listens to {event}");
                    if let Err(e) = self.subscriptions.add(&conn_id, &event).await {
                        log::error!("Failed to record subscription {event} for {conn_id}: {e}");
                    }
                }
                ControlEvent::Closed(id) => {
                    self.registry.remove(&id).await;
                    self.cleanup(&id).await;
                    log::debug!("Cleaned up after {id}");
                }
            }
        }
    }

    /// Drop every durable trace of a connection. Idempotent.
    async fn cleanup(&self, id: &ConnectionId) {
        let (dir, subs, rooms) = tokio::join!(
            self.directory.remove(id),
            self.subscriptions.remove_all(id),
            self.rooms.leave_all_rooms(id),
        );
        if let Err(e) = dir {
            log::error!("Directory cleanup for {id} failed: {e}");
        }
        if let Err(e) = subs {
            log::error!("Subscription cleanup for {id} failed: {e}");
        }
        if let Err(e) = rooms {
            log::error!("Room cleanup for {id} failed: {e}");
        }
    }
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    local_addr: SocketAddr,
    control: Control,
    connection_rx: Mutex<Option<mpsc::UnboundedReceiver<Connection>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RelayServer {
    /// Bind, attach to the store and start serving.
    pub async fn start(config: ServerConfig, store: Arc<dyn Store>) -> Result<Self> {
        let keys = Keyspace::new(config.namespace.clone());
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let registry = LocalRegistry::new();
        let directory = Arc::new(ConnectionDirectory::new(store.clone(), keys.clone(), registry.clone()));
        directory.start().await?;

        let engine = Arc::new(DeliveryEngine::new(
            store.clone(),
            &keys,
            directory.clone(),
            config.retry,
            config.queue.clone(),
        ));
        engine.start().await;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (connections_tx, connection_rx) = mpsc::unbounded_channel();
        let control = Control {
            registry: registry.clone(),
            directory,
            subscriptions: SubscriptionStore::new(store.clone(), keys.clone()),
            rooms: RoomStore::new(store, keys),
            engine,
            connections: connections_tx,
        };

        let tasks = vec![
            tokio::spawn(control.clone().run(control_rx)),
            tokio::spawn(accept_loop(listener, registry, control_tx)),
        ];
        log::info!("Relay server listening on {local_addr} (namespace {})", config.namespace);

        Ok(Self {
            config,
            local_addr,
            control,
            connection_rx: Mutex::new(Some(connection_rx)),
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Stream of newly opened local connections. Can be taken once.
    pub fn take_connection_rx(&self) -> Option<mpsc::UnboundedReceiver<Connection>> {
        self.connection_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Queue `event` for one connection, on any server in the cluster.
    /// Bypasses subscription filtering.
    pub async fn send(&self, id: &ConnectionId, event: &str, payload: Value) -> Result<MessageId> {
        self.control.engine.register_send(id, event, payload).await
    }

    /// Queue `event` for every subscribed connection in the cluster.
    pub async fn broadcast(&self, event: &str, payload: Value) -> Result<Vec<MessageId>> {
        self.control.engine.broadcast(event, payload).await
    }

    /// Queue `event` for every subscribed member of `room`.
    pub async fn send_to_room(&self, room: &str, event: &str, payload: Value) -> Result<Vec<MessageId>> {
        self.control.engine.send_to_room(room, event, payload).await
    }

    pub async fn join(&self, id: &ConnectionId, room: &str) -> Result<()> {
        self.control.rooms.join_room(id, room).await?;
        Ok(())
    }

    pub async fn leave(&self, id: &ConnectionId, room: &str) -> Result<()> {
        self.control.rooms.leave_room(id, room).await?;
        Ok(())
    }

    pub async fn rooms_of(&self, id: &ConnectionId) -> Result<Vec<String>> {
        Ok(self.control.rooms.rooms_of(id).await?)
    }

    pub async fn subscriptions_of(&self, id: &ConnectionId) -> Result<Vec<String>> {
        Ok(self.control.subscriptions.list_subscriptions(id).await?)
    }

    /// Messages not yet acknowledged, exhausted ones included.
    pub async fn remaining_pending_count(&self) -> Result<usize> {
        self.control.engine.remaining_count().await
    }

    pub async fn pending_message_ids(&self) -> Result<Vec<MessageId>> {
        self.control.engine.pending_ids().await
    }

    pub async fn exhausted_message_ids(&self) -> Result<Vec<MessageId>> {
        self.control.engine.exhausted_ids().await
    }

    /// Forget every unacknowledged message and every room in the namespace.
    /// Connections and their subscriptions are left alone.
    pub async fn clear_all(&self) -> Result<()> {
        self.control.engine.clear().await?;
        self.control.rooms.clear().await?;
        log::info!("Cleared pending messages and rooms");
        Ok(())
    }

    /// Every connection in the cluster.
    pub async fn connection_ids(&self) -> Result<Vec<ConnectionId>> {
        self.control.directory.all_ids().await
    }

    /// Connections whose sockets this server holds.
    pub async fn local_connection_ids(&self) -> Vec<ConnectionId> {
        self.control.registry.all_ids().await
    }

    /// Handle of a connection held by this server.
    pub async fn connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.control.registry.get(id).await
    }

    /// Stop accepting, close local sockets and stop local workers.
    /// Queued deliveries stay in the store for the rest of the cluster.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        // Accept loop first so no new sockets arrive while shutting down
        if let Some(accept) = tasks.get(1) {
            accept.abort();
        }

        self.control.engine.close().await;

        let local = self.control.registry.all_ids().await;
        self.control.registry.close_all().await;
        for id in &local {
            if let Some(conn) = self.control.registry.get(id).await {
                let _ = tokio::time::timeout(CLOSE_GRACE, conn.closed()).await;
            }
            self.control.registry.remove(id).await;
            self.control.cleanup(id).await;
        }

        self.control.directory.close().await;
        for task in tasks {
            task.abort();
        }
        log::info!("Relay server on {} closed", self.local_addr);
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, registry: LocalRegistry, control: ControlSender) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("Accept failed: {e}");
                continue;
            }
        };
        log::debug!("New TCP connection from {addr}");

        let registry = registry.clone();
        let control = control.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => {
                    let conn = registry.add(ws, control).await;
                    log::debug!("WebSocket {} established from {addr}", conn.id());
                }
                Err(e) => log::warn!("WebSocket handshake with {addr} failed: {e}"),
            }
        });
    }
}
