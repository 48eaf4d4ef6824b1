//! # wsrelay: reliable pub/sub over WebSockets
//!
//! Delivers events to connected clients at least once, across any number of
//! server processes sharing one store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐       ┌─────────────┐
//! │ RelayClient │ ◄─────────────────► │ RelayServer │ ◄───► │             │
//! │ (dedup,     │     JSON frames     │ (process 1) │       │    Store    │
//! │  reconnect) │                     └─────────────┘       │ (Redis or   │
//! └─────────────┘                     ┌─────────────┐       │  in-memory) │
//!                                     │ RelayServer │ ◄───► │             │
//!                                     │ (process 2) │       └─────────────┘
//!                                     └─────────────┘
//! ```
//!
//! Every send is recorded in a durable ledger and retried from a shared job
//! queue until the client acknowledges it or the retry budget runs out.
//! Clients drop redelivered requests by comparing time-ordered message ids.
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire frames (Request, Response, SubscriptionDeclare)
//! - [`connection`]: Server-side handle for one socket
//! - [`registry`]: Sockets held by this process
//! - [`directory`]: Cluster-wide connection set and fan-out channel
//! - [`subscriptions`] / [`rooms`]: Broadcast filtering and multicast groups
//! - [`ledger`] / [`queue`] / [`delivery`]: Guaranteed delivery
//! - [`server`] / [`client`]: Public surfaces
//! - [`store`]: Storage substrate (memory, Redis)

pub mod client;
pub mod connection;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod events;
pub mod ids;
pub mod ledger;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod store;
pub mod subscriptions;

// Re-exports for convenience
pub use client::{ClientConfig, RelayClient, SessionState};
pub use connection::Connection;
pub use delivery::{DeliveryEngine, PendingSend, Transmit};
pub use error::{RelayError, Result};
pub use events::EventKey;
pub use ids::{ConnectionId, MessageId};
pub use ledger::{DeliveryLedger, DeliveryState};
pub use protocol::{DecodeError, Frame, FrameKind};
pub use queue::{Backoff, JobEvent, QueueConfig, RetryPolicy};
pub use server::{RelayServer, ServerConfig};
pub use store::{Keyspace, MemoryStore, Store, StoreError};
#[cfg(feature = "redis")]
pub use store::RedisStore;
