//! # Parley Protocol Crate
//!
//! Wire types shared by the relay core, the gateway and clients.
//!
//! ## Architecture
//!
//! - **Envelope**: the validated unit of transmission (`chat`, `typing`, `presence`, `error`)
//! - **Codec**: strict JSON decoding with a documented error per rejection, and encoding
//! - **Control**: non-envelope frames for authentication, room membership and keepalive
//!
//! ## Usage
//!
//! ```rust
//! use parley_protocol::{decode, encode, MessageType, Target};
//!
//! let envelope = decode(r#"{"type":"chat","room":"lobby","content":"hi"}"#).unwrap();
//! assert_eq!(envelope.kind, MessageType::Chat);
//! assert!(matches!(envelope.target, Target::Room(_)));
//!
//! let again = decode(&encode(&envelope)).unwrap();
//! assert_eq!(again, envelope);
//! ```

pub mod codec;
pub mod control;
pub mod envelope;
pub mod error;
pub mod ids;

pub use codec::{
    decode, decode_frame, decode_outbound, encode, encode_control, encode_event, Frame,
};
pub use control::{ClientControl, OutboundFrame, ServerEvent};
pub use envelope::{EncryptionMeta, Envelope, MessageType, PresenceState, Target, TypingState};
pub use error::{CodecError, CodecResult};
pub use ids::{RoomId, UserId};
