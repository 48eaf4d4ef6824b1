//! Client session with duplicate suppression and automatic reconnect.
//!
//! Provides:
//! - Connection lifecycle (connect, close, reconnect on abnormal close)
//! - Acknowledgment of every accepted server request
//! - Dedup of redelivered requests by message id
//! - Re-declaration of subscribed events on every (re)connect
//!
//! ```text
//!            connect ok                      abnormal close
//! Connecting ─────────► Open ───────────────────────────────► Reconnecting
//!     │                  │ ▲                                       │
//!     │ close()          │ └──────────── connect ok ───────────────┘
//!     ▼                  ▼ close() / normal close          connect failed:
//!   Closed ◄──────────── Closed                            wait, try again
//! ```

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{RelayError, Result};
use crate::events::{Dispatcher, EventKey};
use crate::ids::MessageId;
use crate::protocol::Frame;

/// How long a local close waits for the server's Close reply.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    /// Delay before each reconnection attempt
    pub reconnect_interval: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            reconnect_interval: Duration::from_secs(1),
        }
    }
}

/// Client session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

enum Outgoing {
    Frame(Message, Option<oneshot::Sender<Result<()>>>),
    Close,
}

struct Shared {
    config: ClientConfig,
    dispatcher: Dispatcher,
    state: watch::Sender<SessionState>,
    /// Writer of the current socket, if open
    outgoing: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    /// Highest request id processed; empty until the first one
    last_accepted: Mutex<String>,
    shutdown: watch::Sender<bool>,
}

/// The relay client.
///
/// Keeps one connection to the server alive until `close` is called, and
/// surfaces server requests as events registered with `on`.
pub struct RelayClient {
    shared: Arc<Shared>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RelayClient {
    /// Start connecting in the background. Use `wait_ready` to wait for the
    /// first open.
    pub fn connect(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            dispatcher: Dispatcher::new(),
            state,
            outgoing: Mutex::new(None),
            last_accepted: Mutex::new(String::new()),
            shutdown,
        });
        let supervisor = tokio::spawn(shared.clone().supervise(shutdown_rx));
        Self {
            shared,
            supervisor: tokio::sync::Mutex::new(Some(supervisor)),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a listener. `open`, `close` and `reconnect` are session
    /// notifications; any other name subscribes to that server event.
    pub fn on<F>(&self, event: impl Into<EventKey>, listener: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let key = event.into();
        let first = self.shared.dispatcher.on(key.clone(), listener);
        if let (true, Some(name)) = (first, key.app_event()) {
            // No-op until open; opening declares every registered event
            self.shared.declare(name);
        }
    }

    /// Send a request to the server. Fails unless the session is open.
    pub async fn send(&self, event: &str, payload: Value) -> Result<MessageId> {
        let id = MessageId::generate();
        let frame = Frame::request(id.clone(), event, payload);
        self.shared.send_frame(&frame).await?;
        Ok(id)
    }

    /// Wait until the session is open.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        let state = *rx
            .wait_for(|s| matches!(s, SessionState::Open | SessionState::Closed))
            .await
            .map_err(|_| RelayError::ConnectionClosed)?;
        match state {
            SessionState::Open => Ok(()),
            _ => Err(RelayError::ConnectionClosed),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Id of the most recent request handed to listeners.
    pub fn last_accepted(&self) -> Option<MessageId> {
        let last = self.shared.last_accepted.lock().unwrap_or_else(|e| e.into_inner());
        (!last.is_empty()).then(|| MessageId::from(last.as_str()))
    }

    /// Close with a normal-closure frame and stop reconnecting.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.shutdown.send(true);
        if let Some(handle) = self.supervisor.lock().await.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        let _ = self.shared.shutdown.send(true);
    }
}

impl Shared {
    async fn supervise(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut opened_before = false;

        loop {
            if *shutdown.borrow() {
                break;
            }
            log::debug!("Connecting to {}", self.config.url);
            let connected = tokio::select! {
                _ = shutdown.changed() => break,
                r = tokio_tungstenite::connect_async(self.config.url.as_str()) => r,
            };

            match connected {
                Ok((ws, _)) => {
                    let abnormal = self.run_session(ws, &mut shutdown, opened_before).await;
                    opened_before = true;
                    self.dispatcher.emit(&EventKey::Close, &Value::Null);
                    if !abnormal {
                        log::info!("Connection to {} closed", self.config.url);
                        break;
                    }
                    log::warn!(
                        "Connection to {} lost, reconnecting in {:?}",
                        self.config.url,
                        self.config.reconnect_interval
                    );
                }
                Err(e) => log::warn!("Connect to {} failed: {e}", self.config.url),
            }

            self.state.send_replace(SessionState::Reconnecting);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }

        self.state.send_replace(SessionState::Closed);
    }

    /// Drive one open socket. Returns true when it ended abnormally.
    async fn run_session<S>(
        &self,
        ws: WebSocketStream<S>,
        shutdown: &mut watch::Receiver<bool>,
        reconnected: bool,
    ) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, mut stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, rx));
        *self.outgoing.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx.clone());

        for event in self.dispatcher.app_events() {
            self.declare(&event);
        }
        self.state.send_replace(SessionState::Open);
        log::info!("Connected to {}", self.config.url);
        self.dispatcher.emit(&EventKey::Open, &Value::Null);
        if reconnected {
            self.dispatcher.emit(&EventKey::Reconnect, &Value::Null);
        }

        let abnormal = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = tx.send(Outgoing::Close);
                    // Let the server answer the close
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
                        while let Some(Ok(_)) = stream.next().await {}
                    })
                    .await;
                    break false;
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Close(frame))) => {
                        break !matches!(frame, Some(CloseFrame { code: CloseCode::Normal, .. }));
                    }
                    Some(Ok(msg)) => self.handle_frame(&msg),
                    Some(Err(e)) => {
                        log::debug!("Socket error: {e}");
                        break true;
                    }
                    None => break true,
                },
            }
        };

        *self.outgoing.lock().unwrap_or_else(|e| e.into_inner()) = None;
        drop(tx);
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, writer).await;
        abnormal
    }

    fn handle_frame(&self, msg: &Message) {
        if !msg.is_text() {
            return;
        }
        let frame = match Frame::from_ws(msg) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                return;
            }
        };
        match frame {
            Frame::Request { id, event, data } => self.handle_request(id, event, data),
            Frame::Response { req_id, .. } => log::debug!("Server acknowledged {req_id}"),
            Frame::SubscriptionDeclare { event } => {
                log::warn!("Unexpected subscription declare for {event}")
            }
        }
    }

    fn handle_request(&self, id: MessageId, event: String, data: Value) {
        {
            let last = self.last_accepted.lock().unwrap_or_else(|e| e.into_inner());
            if !last.is_empty() && id.as_str() <= last.as_str() {
                log::debug!("Discarding duplicate request {id} ({event})");
                return;
            }
        }

        self.dispatcher.emit(&EventKey::App(event.clone()), &data);
        self.post(&Frame::response(id.clone(), event));
        *self.last_accepted.lock().unwrap_or_else(|e| e.into_inner()) = id.as_str().to_string();
    }

    fn declare(&self, event: &str) {
        log::debug!("Declaring subscription to {event}");
        self.post(&Frame::declare(event));
    }

    /// Queue a frame on the open socket without waiting for the write.
    fn post(&self, frame: &Frame) {
        let msg = match frame.to_ws() {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Cannot encode {:?} frame: {e}", frame.kind());
                return;
            }
        };
        if let Some(tx) = self.outgoing.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = tx.send(Outgoing::Frame(msg, None));
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let msg = frame.to_ws()?;
        let (done_tx, done_rx) = oneshot::channel();
        {
            let outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
            let tx = outgoing.as_ref().ok_or(RelayError::NotConnected)?;
            tx.send(Outgoing::Frame(msg, Some(done_tx)))
                .map_err(|_| RelayError::NotConnected)?;
        }
        done_rx.await.map_err(|_| RelayError::ConnectionClosed)?
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(out) = rx.recv().await {
        match out {
            Outgoing::Frame(msg, done) => {
                let result = sink.send(msg).await.map_err(RelayError::from);
                let failed = result.is_err();
                if let Some(done) = done {
                    let _ = done.send(result);
                }
                if failed {
                    break;
                }
            }
            Outgoing::Close => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
}
