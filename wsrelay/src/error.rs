//! Error type returned by the public relay operations.

use thiserror::Error;

use crate::ids::ConnectionId;
use crate::protocol::DecodeError;
use crate::store::StoreError;

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A frame could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    /// The connection is not held by this process.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
    /// The shared store failed or is unreachable.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// The socket was closed before the frame was written.
    #[error("Connection closed")]
    ConnectionClosed,
    /// The client session is not open.
    #[error("Not connected")]
    NotConnected,
    /// WebSocket transport failure.
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
