//! The envelope exchanged between the relay and its clients.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::CodecError;
use crate::ids::{RoomId, UserId};

/// Closed set of envelope types. Anything else on the wire is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Chat,
    Typing,
    Presence,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Typing => "typing",
            Self::Presence => "presence",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "chat" => Ok(Self::Chat),
            "typing" => Ok(Self::Typing),
            "presence" => Ok(Self::Presence),
            "error" => Ok(Self::Error),
            other => Err(CodecError::UnknownMessageType(other.to_string())),
        }
    }
}

/// Where an envelope goes. Exactly one of these is present on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Direct(UserId),
    Room(RoomId),
}

impl Target {
    pub fn room(&self) -> Option<&RoomId> {
        match self {
            Self::Room(room) => Some(room),
            Self::Direct(_) => None,
        }
    }

    pub fn recipient(&self) -> Option<&UserId> {
        match self {
            Self::Direct(user) => Some(user),
            Self::Room(_) => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(user) => write!(f, "user:{user}"),
            Self::Room(room) => write!(f, "room:{room}"),
        }
    }
}

/// Encryption metadata attached to an encrypted envelope. The key itself never travels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionMeta {
    pub alg: String,
    pub nonce: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageType,
    /// Overwritten by the relay with the authenticated identity before routing.
    pub sender: Option<UserId>,
    pub target: Target,
    /// UTF-8 text, or standard base64 ciphertext when `encryption` is set.
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub encryption: Option<EncryptionMeta>,
}

impl Envelope {
    pub fn new(kind: MessageType, target: Target, content: impl Into<String>) -> Self {
        Self {
            kind,
            sender: None,
            target,
            content: content.into(),
            timestamp: Utc::now(),
            encryption: None,
        }
    }

    pub fn chat(target: Target, content: impl Into<String>) -> Self {
        Self::new(MessageType::Chat, target, content)
    }

    pub fn typing(sender: UserId, target: Target, state: TypingState) -> Self {
        Self::new(MessageType::Typing, target, state.as_str()).with_sender(sender)
    }

    pub fn presence(sender: UserId, target: Target, state: PresenceState) -> Self {
        Self::new(MessageType::Presence, target, state.as_str()).with_sender(sender)
    }

    /// Error envelope; content is `"<code>: <message>"`.
    pub fn error(target: Target, code: &str, message: impl fmt::Display) -> Self {
        Self::new(MessageType::Error, target, format!("{code}: {message}"))
    }

    pub fn with_sender(mut self, sender: UserId) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_encryption(mut self, meta: EncryptionMeta) -> Self {
        self.encryption = Some(meta);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingState {
    Started,
    Stopped,
}

impl TypingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "started" => Some(Self::Started),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Online,
    Offline,
}

impl PresenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_parses_closed_set() {
        for kind in [
            MessageType::Chat,
            MessageType::Typing,
            MessageType::Presence,
            MessageType::Error,
        ] {
            assert_eq!(kind.as_str().parse::<MessageType>().unwrap(), kind);
        }

        assert_eq!(
            "Chat".parse::<MessageType>(),
            Err(CodecError::UnknownMessageType("Chat".to_string()))
        );
    }

    #[test]
    fn error_envelope_prefixes_code() {
        let envelope = Envelope::error(
            Target::Direct(UserId::from("alice")),
            "not_authenticated",
            "log in first",
        );
        assert_eq!(envelope.kind, MessageType::Error);
        assert_eq!(envelope.content, "not_authenticated: log in first");
    }

    #[test]
    fn typing_state_round_trips_through_text() {
        assert_eq!(TypingState::parse("started"), Some(TypingState::Started));
        assert_eq!(TypingState::parse(TypingState::Stopped.as_str()), Some(TypingState::Stopped));
        assert_eq!(TypingState::parse("typing"), None);
    }
}
