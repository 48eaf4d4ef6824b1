//! Per-process map from connection id to live socket.
//!
//! This is the only component that can actually write bytes to a client;
//! everything else addresses connections by id and goes through the
//! directory fan-out.

use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tokio_tungstenite::WebSocketStream;

use crate::connection::{Connection, ControlSender};
use crate::error::{RelayError, Result};
use crate::ids::ConnectionId;

/// Live connections held by this process.
#[derive(Clone, Default)]
pub struct LocalRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, Connection>>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an upgraded socket under a fresh id and store it.
    pub async fn add<S>(&self, socket: WebSocketStream<S>, control: ControlSender) -> Connection
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = ConnectionId::generate();
        // Hold the write lock across spawn so a fast close cannot race the insert
        let mut connections = self.connections.write().await;
        let conn = Connection::spawn(id.clone(), socket, control);
        connections.insert(id, conn.clone());
        conn
    }

    /// Forget a connection. Absent ids are ignored.
    pub async fn remove(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.write().await.remove(id)
    }

    /// Write a text frame to a locally held connection.
    pub async fn send(&self, id: &ConnectionId, text: &str) -> Result<()> {
        let conn = self
            .get(id)
            .await
            .ok_or_else(|| RelayError::UnknownConnection(id.clone()))?;
        debug!("ws send to {id}: {text}");
        conn.send(text).await
    }

    /// Queue a text frame on a locally held connection without waiting for
    /// the write. Frames posted to one connection are written in order.
    pub async fn post(&self, id: &ConnectionId, text: String) -> Result<()> {
        let conn = self
            .get(id)
            .await
            .ok_or_else(|| RelayError::UnknownConnection(id.clone()))?;
        debug!("ws post to {id}: {text}");
        conn.post(text)
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    /// Ids live in this process only.
    pub async fn all_ids(&self) -> Vec<ConnectionId> {
        self.connections.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Start a close handshake on every local connection.
    pub async fn close_all(&self) {
        for conn in self.connections.read().await.values() {
            conn.close();
        }
    }
}
