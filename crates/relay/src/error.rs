//! Error taxonomy for relay operations.

use parley_crypto::CryptoError;
use parley_protocol::{CodecError, RoomId};
use thiserror::Error;

use crate::collaborators::CollaboratorError;
use crate::registry::ConnectionId;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("envelope must target exactly one of recipient or room")]
    AmbiguousTarget,

    #[error("connection is not authenticated")]
    NotAuthenticated,

    #[error("token rejected: {0}")]
    InvalidToken(String),

    #[error("connection is already authenticated as another identity")]
    IdentityConflict,

    #[error("encrypted content failed authentication")]
    AuthenticationFailed,

    #[error("key can no longer be used for encryption")]
    KeyExhausted,

    #[error("not a member of room {0}")]
    NotRoomMember(RoomId),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} is already attached")]
    ConnectionExists(ConnectionId),

    #[error("outbound queue for connection {0} is full")]
    OutboundFull(ConnectionId),

    #[error("connection {0} is no longer writable")]
    OutboundClosed(ConnectionId),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl RelayError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedEnvelope(message.into())
    }

    /// Stable snake_case code carried in `error` envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::UnknownMessageType(_) => "unknown_message_type",
            Self::AmbiguousTarget => "ambiguous_target",
            Self::NotAuthenticated => "not_authenticated",
            Self::InvalidToken(_) => "invalid_token",
            Self::IdentityConflict => "identity_conflict",
            Self::AuthenticationFailed => "authentication_failed",
            Self::KeyExhausted => "key_exhausted",
            Self::NotRoomMember(_) => "not_room_member",
            Self::UnknownConnection(_) => "unknown_connection",
            Self::ConnectionExists(_) => "connection_exists",
            Self::OutboundFull(_) => "backpressure",
            Self::OutboundClosed(_) => "connection_closed",
            Self::Collaborator(_) => "unavailable",
        }
    }

    /// Errors after which the connection is still usable; the caller reports and continues.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::UnknownConnection(_)
                | Self::ConnectionExists(_)
                | Self::IdentityConflict
                | Self::OutboundClosed(_)
        )
    }
}

impl From<CodecError> for RelayError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::MalformedEnvelope(message) => Self::MalformedEnvelope(message),
            CodecError::UnknownMessageType(kind) => Self::UnknownMessageType(kind),
            CodecError::AmbiguousTarget => Self::AmbiguousTarget,
        }
    }
}

impl From<CryptoError> for RelayError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailed => Self::AuthenticationFailed,
            CryptoError::KeyExhausted => Self::KeyExhausted,
            other => Self::MalformedEnvelope(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_errors_keep_their_kind() {
        assert!(matches!(
            RelayError::from(CodecError::AmbiguousTarget),
            RelayError::AmbiguousTarget
        ));
        assert_eq!(
            RelayError::from(CodecError::UnknownMessageType("shout".into())).code(),
            "unknown_message_type"
        );
    }

    #[test]
    fn crypto_failures_map_to_relay_kinds() {
        assert!(matches!(
            RelayError::from(CryptoError::AuthenticationFailed),
            RelayError::AuthenticationFailed
        ));
        assert!(matches!(
            RelayError::from(CryptoError::InvalidNonce(3)),
            RelayError::MalformedEnvelope(_)
        ));
    }
}
