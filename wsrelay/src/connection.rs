//! Server-side handle for one accepted WebSocket.
//!
//! ```text
//!            ┌──────────── reader task ────────────┐
//! socket ──► │ decode ─┬─ Request  ──► on(event)   │
//!            │         ├─ Response ──► ControlEvent│──► server control loop
//!            │         └─ Declare  ──► ControlEvent│
//!            └─────────────────────────────────────┘
//! send() ──► outgoing channel ──► writer task ──► socket
//! ```
//!
//! Frames that fail to decode are logged and skipped; they never end the
//! connection.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{RelayError, Result};
use crate::events::{Dispatcher, EventKey};
use crate::ids::{ConnectionId, MessageId};
use crate::protocol::Frame;

/// Protocol traffic the server consumes itself rather than the application.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// A socket was accepted and registered locally.
    Opened(Connection),
    /// The peer acknowledged a Request.
    Response {
        conn_id: ConnectionId,
        req_id: MessageId,
        event: String,
    },
    /// The peer declared interest in an event.
    SubscriptionDeclared { conn_id: ConnectionId, event: String },
    /// The socket closed. Sent exactly once per connection.
    Closed(ConnectionId),
}

pub type ControlSender = mpsc::UnboundedSender<ControlEvent>;

enum Outgoing {
    Frame(Message, Option<oneshot::Sender<Result<()>>>),
    Close,
    Stop,
}

struct Inner {
    id: ConnectionId,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    dispatcher: Dispatcher,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// A live connection. Cheap to clone; clones share the socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Take ownership of an upgraded socket and start its reader and writer.
    ///
    /// `ControlEvent::Opened` is queued before the reader starts, so the
    /// control loop always sees a connection open before it sees it close.
    pub(crate) fn spawn<S>(id: ConnectionId, ws: WebSocketStream<S>, control: ControlSender) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let conn = Self {
            inner: Arc::new(Inner {
                id,
                outgoing: out_tx,
                dispatcher: Dispatcher::new(),
                closed: AtomicBool::new(false),
                closed_tx,
            }),
        };

        let _ = control.send(ControlEvent::Opened(conn.clone()));

        tokio::spawn(Self::write_loop(conn.id().clone(), sink, out_rx));
        let reader = conn.clone();
        tokio::spawn(async move { reader.read_loop(stream, control).await });

        conn
    }

    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Register a listener for an application event sent by the peer, or
    /// for `"close"`.
    pub fn on<F>(&self, event: impl Into<EventKey>, listener: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on(event.into(), listener);
    }

    /// Register a listener fired once when the socket closes.
    pub fn on_close<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.dispatcher.on(EventKey::Close, move |_| listener());
    }

    /// Write one text frame. Resolves once the socket accepted it.
    pub async fn send(&self, text: impl Into<String>) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::ConnectionClosed);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.inner
            .outgoing
            .send(Outgoing::Frame(Message::text(text.into()), Some(done_tx)))
            .map_err(|_| RelayError::ConnectionClosed)?;
        done_rx.await.map_err(|_| RelayError::ConnectionClosed)?
    }

    /// Queue one text frame behind everything sent before it, without
    /// waiting for the socket.
    pub fn post(&self, text: impl Into<String>) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::ConnectionClosed);
        }
        self.inner
            .outgoing
            .send(Outgoing::Frame(Message::text(text.into()), None))
            .map_err(|_| RelayError::ConnectionClosed)
    }

    /// Encode and write a protocol frame.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.send(frame.encode()?).await
    }

    /// Start a normal-closure handshake. The close notification fires once
    /// the handshake completes or the socket drops.
    pub fn close(&self) {
        let _ = self.inner.outgoing.send(Outgoing::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Wait until the socket has closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn write_loop<S>(
        id: ConnectionId,
        mut sink: SplitSink<WebSocketStream<S>, Message>,
        mut rx: mpsc::UnboundedReceiver<Outgoing>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(out) = rx.recv().await {
            match out {
                Outgoing::Frame(msg, done) => {
                    let result = sink.send(msg).await.map_err(RelayError::from);
                    let failed = result.is_err();
                    match (done, result) {
                        (Some(done), result) => {
                            let _ = done.send(result);
                        }
                        (None, Err(e)) => debug!("Write to {id} failed: {e}"),
                        (None, Ok(())) => {}
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
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!("Close frame to {id} not sent: {e}");
                    }
                }
                Outgoing::Stop => {
                    // Flushes the Close reply tungstenite queued when the
                    // peer started the handshake
                    if let Err(e) = sink.close().await {
                        debug!("Closing sink for {id}: {e}");
                    }
                    break;
                }
            }
        }
        debug!("Writer for {id} stopped");
    }

    async fn read_loop<S>(self, mut stream: SplitStream<WebSocketStream<S>>, control: ControlSender)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                    self.handle_frame(&msg, &control);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error on {}: {e}", self.id());
                    break;
                }
            }
        }
        self.mark_closed(&control);
    }

    fn handle_frame(&self, msg: &Message, control: &ControlSender) {
        match Frame::from_ws(msg) {
            Ok(Frame::Request { id, event, data }) => {
                debug!("Request {id} [{event}] from {}", self.id());
                let key = EventKey::App(event);
                if self.inner.dispatcher.emit(&key, &data) == 0 {
                    debug!("No listener for {key:?} on {}", self.id());
                }
            }
            Ok(Frame::Response { req_id, event }) => {
                let _ = control.send(ControlEvent::Response {
                    conn_id: self.id().clone(),
                    req_id,
                    event,
                });
            }
            Ok(Frame::SubscriptionDeclare { event }) => {
                let _ = control.send(ControlEvent::SubscriptionDeclared {
                    conn_id: self.id().clone(),
                    event,
                });
            }
            Err(e) => {
                warn!("Dropping frame from {}: {e}", self.id());
            }
        }
    }

    fn mark_closed(&self, control: &ControlSender) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Connection {} closed", self.id());
        self.inner.closed_tx.send_replace(true);
        let _ = self.inner.outgoing.send(Outgoing::Stop);
        self.inner.dispatcher.emit(&EventKey::Close, &Value::Null);
        let _ = control.send(ControlEvent::Closed(self.id().clone()));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
