//! Shared application state for the gateway

use parley_config::RelayConfig;
use parley_database::EnvelopeRepository;
use parley_relay::Relay;
use std::sync::Arc;

/// Everything a connection task needs, shared behind one `Arc`.
#[derive(Clone)]
pub struct GatewayState {
    pub relay: Arc<Relay>,
    /// Envelopes held for users who were offline. Replayed after authentication.
    pub pending: Option<EnvelopeRepository>,
    pub relay_config: RelayConfig,
}

impl GatewayState {
    pub fn new(relay: Arc<Relay>, relay_config: RelayConfig) -> Self {
        Self {
            relay,
            pending: None,
            relay_config,
        }
    }

    pub fn with_pending(mut self, pending: EnvelopeRepository) -> Self {
        self.pending = Some(pending);
        self
    }
}
