//! Control frames that sit beside the envelope stream.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::envelope::{Envelope, MessageType};
use crate::ids::{RoomId, UserId};

/// Frames a client sends that are not envelopes. Recognised by their `action` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientControl {
    /// In-band authentication when no token was presented on upgrade
    Auth { token: String },
    Join { room: RoomId },
    Leave { room: RoomId },
    Ping,
}

/// Server events sent to WebSocket clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once after the socket is attached
    Hello { connection_id: String },
    /// Sent when the connection must authenticate in-band
    AuthRequired,
    Authenticated { user_id: UserId },
    Joined { room: RoomId },
    Left { room: RoomId },
    Pong,
}

/// A frame queued for a single connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Envelope(Arc<Envelope>),
    Event(ServerEvent),
}

impl OutboundFrame {
    pub fn envelope(envelope: Envelope) -> Self {
        Self::Envelope(Arc::new(envelope))
    }

    /// Envelope type, or `None` for control events.
    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            Self::Envelope(envelope) => Some(envelope.kind),
            Self::Event(_) => None,
        }
    }

    pub fn as_envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Envelope(envelope) => Some(envelope),
            Self::Event(_) => None,
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Self::Envelope(envelope) => crate::codec::encode(envelope),
            Self::Event(event) => crate::codec::encode_event(event),
        }
    }
}

impl From<ServerEvent> for OutboundFrame {
    fn from(event: ServerEvent) -> Self {
        Self::Event(event)
    }
}
