//! # Parley Relay Crate
//!
//! The real-time core: who is connected, which rooms they sit in, and how one
//! envelope reaches every live connection it should.
//!
//! ## Architecture
//!
//! - **Registry**: live connections, their identities and room memberships
//! - **Dispatcher**: recipient resolution and per-connection fan-out
//! - **Presence**: best-effort typing and online/offline signalling
//! - **Relay**: the `on_connect` / `on_message` / `on_disconnect` surface the transport calls
//! - **Collaborators**: identity, group membership, key exchange and durable storage contracts
//!
//! ## Usage
//!
//! ```rust,ignore
//! use parley_relay::{Collaborators, Relay, RelaySettings};
//!
//! let relay = Relay::new(collaborators, RelaySettings::default());
//! relay.on_connect(&connection_id, outbound_tx).await?;
//! let inbound = relay.on_message(&connection_id, &frame_text).await?;
//! relay.on_disconnect(&connection_id).await;
//! ```

pub mod collaborators;
pub mod dispatcher;
pub mod error;
pub mod presence;
pub mod registry;
pub mod relay;

pub use collaborators::{
    CollaboratorError, Collaborators, InMemoryDirectory, KeyProvider, KeyScope,
    MembershipDirectory, MemoryOfflineStore, OfflineStore, Room, StaticKeys, StaticTokens,
    TokenVerifier,
};
pub use dispatcher::{DeliveryOutcome, DeliveryResult, DispatchOptions, Dispatcher, Exclude};
pub use error::{RelayError, RelayResult};
pub use presence::PresenceNotifier;
pub use registry::{ConnectionId, ConnectionRegistry, Departed, JoinOutcome, Outbound};
pub use relay::{Inbound, Relay, RelaySettings};
