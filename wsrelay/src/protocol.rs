//! Text wire protocol for requests, acknowledgments and subscriptions.
//!
//! Every frame is one JSON text message carrying a numeric `kind`:
//! ```text
//! kind 0  Request              {"kind":0,"id":"…","event":"…","data":…}
//! kind 1  Response             {"kind":1,"reqId":"…","event":"…"}
//! kind 2  SubscriptionDeclare  {"kind":2,"event":"…"}
//! ```
//!
//! A Request must be answered by a Response carrying the same id; until then
//! the sender keeps redelivering it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

use crate::error::RelayError;
use crate::ids::MessageId;

/// Numeric frame discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0,
    Response = 1,
    SubscriptionDeclare = 2,
}

impl FrameKind {
    fn from_u64(v: u64) -> Option<Self> {
        match v {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::SubscriptionDeclare),
            _ => None,
        }
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Application data that must be acknowledged.
    Request {
        id: MessageId,
        event: String,
        data: Value,
    },
    /// Acknowledgment of the Request with id `req_id`.
    Response { req_id: MessageId, event: String },
    /// The sender wants to receive broadcasts of `event`.
    SubscriptionDeclare { event: String },
}

/// Flat shape shared by all kinds on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct RawFrame {
    kind: u64,
    #[serde(default)]
    event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "reqId", default, skip_serializing_if = "Option::is_none")]
    req_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl Frame {
    pub fn request(id: MessageId, event: impl Into<String>, data: Value) -> Self {
        Frame::Request {
            id,
            event: event.into(),
            data,
        }
    }

    pub fn response(req_id: MessageId, event: impl Into<String>) -> Self {
        Frame::Response {
            req_id,
            event: event.into(),
        }
    }

    pub fn declare(event: impl Into<String>) -> Self {
        Frame::SubscriptionDeclare {
            event: event.into(),
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Request { .. } => FrameKind::Request,
            Frame::Response { .. } => FrameKind::Response,
            Frame::SubscriptionDeclare { .. } => FrameKind::SubscriptionDeclare,
        }
    }

    pub fn event(&self) -> &str {
        match self {
            Frame::Request { event, .. }
            | Frame::Response { event, .. }
            | Frame::SubscriptionDeclare { event } => event,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, RelayError> {
        let raw = match self {
            Frame::Request { id, event, data } => RawFrame {
                kind: FrameKind::Request as u64,
                event: Some(event.clone()),
                id: Some(id.to_string()),
                req_id: None,
                data: Some(data.clone()),
            },
            Frame::Response { req_id, event } => RawFrame {
                kind: FrameKind::Response as u64,
                event: Some(event.clone()),
                id: None,
                req_id: Some(req_id.to_string()),
                data: None,
            },
            Frame::SubscriptionDeclare { event } => RawFrame {
                kind: FrameKind::SubscriptionDeclare as u64,
                event: Some(event.clone()),
                id: None,
                req_id: None,
                data: None,
            },
        };
        Ok(serde_json::to_string(&raw)?)
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let kind = FrameKind::from_u64(raw.kind).ok_or(DecodeError::UnknownKind(raw.kind))?;
        let event = raw.event.ok_or(DecodeError::MissingField("event"))?;

        match kind {
            FrameKind::Request => {
                let id = raw.id.ok_or(DecodeError::MissingField("id"))?;
                Ok(Frame::Request {
                    id: MessageId::from(id),
                    event,
                    data: raw.data.unwrap_or(Value::Null),
                })
            }
            FrameKind::Response => {
                let req_id = raw.req_id.ok_or(DecodeError::MissingField("reqId"))?;
                Ok(Frame::Response {
                    req_id: MessageId::from(req_id),
                    event,
                })
            }
            FrameKind::SubscriptionDeclare => Ok(Frame::SubscriptionDeclare { event }),
        }
    }

    /// Decode a WebSocket message. Only text frames carry protocol data.
    pub fn from_ws(msg: &Message) -> Result<Self, DecodeError> {
        match msg {
            Message::Text(text) => Self::decode(text.as_str()),
            _ => Err(DecodeError::NotText),
        }
    }

    /// Encode into a WebSocket text message.
    pub fn to_ws(&self) -> Result<Message, RelayError> {
        Ok(Message::text(self.encode()?))
    }
}

/// Frame decoding failures. Logged and dropped by receivers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("Unsupported non-text frame")]
    NotText,
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Unknown message kind {0}")]
    UnknownKind(u64),
    #[error("Missing field '{0}'")]
    MissingField(&'static str),
}
