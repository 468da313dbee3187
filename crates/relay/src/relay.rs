//! Transport-facing entry points.
//!
//! The gateway owns sockets; everything it learns from one is funnelled through
//! [`Relay::on_connect`], [`Relay::on_message`] and [`Relay::on_disconnect`]. Replies
//! for the originating connection (control events, error envelopes) are queued on
//! that connection's outbound channel like any other frame.

use parley_config::RelayConfig;
use parley_crypto::open_envelope;
use parley_protocol::{
    decode_frame, ClientControl, Envelope, Frame, MessageType, OutboundFrame, PresenceState,
    RoomId, ServerEvent, Target, TypingState, UserId,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::collaborators::{
    CollaboratorError, Collaborators, KeyProvider, KeyScope, MembershipDirectory, TokenVerifier,
};
use crate::dispatcher::{DeliveryResult, DispatchOptions, Dispatcher};
use crate::error::{RelayError, RelayResult};
use crate::presence::PresenceNotifier;
use crate::registry::{ConnectionId, ConnectionRegistry, Departed, Outbound};

#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub echo_to_sender: bool,
    /// Decrypt encrypted chat when a key is available and drop it if it does not verify.
    pub verify_encrypted: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            echo_to_sender: true,
            verify_encrypted: true,
        }
    }
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            echo_to_sender: config.echo_to_sender,
            verify_encrypted: config.verify_encrypted,
        }
    }
}

/// What an inbound frame turned out to be, for transport-side bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Authenticated(UserId),
    Joined(RoomId),
    Left(RoomId),
    Pong,
    Delivered(DeliveryResult),
    Typing { target: Target, state: TypingState },
    Presence,
}

pub struct Relay {
    registry: ConnectionRegistry,
    dispatcher: Arc<Dispatcher>,
    presence: PresenceNotifier,
    verifier: Arc<dyn TokenVerifier>,
    directory: Arc<dyn MembershipDirectory>,
    keys: Arc<dyn KeyProvider>,
    settings: RelaySettings,
}

impl Relay {
    pub fn new(collaborators: Collaborators, settings: RelaySettings) -> Self {
        let registry = ConnectionRegistry::new();
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            collaborators.offline,
            DispatchOptions {
                echo_to_sender: settings.echo_to_sender,
            },
        ));

        Self {
            presence: PresenceNotifier::new(dispatcher.clone()),
            registry,
            dispatcher,
            verifier: collaborators.verifier,
            directory: collaborators.directory,
            keys: collaborators.keys,
            settings,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn presence(&self) -> &PresenceNotifier {
        &self.presence
    }

    /// Attach a new socket and greet it.
    pub async fn on_connect(&self, id: &ConnectionId, outbound: Outbound) -> RelayResult<()> {
        self.registry.attach(id.clone(), outbound).await?;
        self.registry
            .send_to(
                id,
                ServerEvent::Hello {
                    connection_id: id.to_string(),
                }
                .into(),
            )
            .await
    }

    /// Resolve a bearer token to an identity without touching any connection.
    pub async fn verify_token(&self, token: &str) -> RelayResult<UserId> {
        self.verifier
            .verify_token(token)
            .await
            .map_err(|err| match err {
                CollaboratorError::TokenRejected(reason) => RelayError::InvalidToken(reason),
                other => RelayError::Collaborator(other),
            })
    }

    /// Verify a bearer token and bind the identity to the connection.
    pub async fn authenticate(&self, id: &ConnectionId, token: &str) -> RelayResult<UserId> {
        let user = self.verify_token(token).await?;

        // A fresh connection occupies no rooms yet, so `online` is announced by `join`.
        self.registry.register(id, user.clone()).await?;
        self.registry
            .send_to(
                id,
                ServerEvent::Authenticated {
                    user_id: user.clone(),
                }
                .into(),
            )
            .await?;
        Ok(user)
    }

    /// Handle one text frame from a connection.
    pub async fn on_message(&self, id: &ConnectionId, raw: &str) -> RelayResult<Inbound> {
        self.registry.touch(id).await;

        match decode_frame(raw)? {
            Frame::Control(ClientControl::Auth { token }) => self
                .authenticate(id, &token)
                .await
                .map(Inbound::Authenticated),
            Frame::Control(ClientControl::Join { room }) => self.join(id, room).await,
            Frame::Control(ClientControl::Leave { room }) => self.leave(id, room).await,
            Frame::Control(ClientControl::Ping) => {
                self.registry.send_to(id, ServerEvent::Pong.into()).await?;
                Ok(Inbound::Pong)
            }
            Frame::Envelope(envelope) => self.route(id, envelope).await,
        }
    }

    /// Remove the connection and announce departures. Safe to call more than once.
    pub async fn on_disconnect(&self, id: &ConnectionId) -> Option<Departed> {
        let departed = self.registry.unregister(id).await?;

        if let Some(user) = &departed.identity {
            self.presence
                .notify_presence_in(
                    user,
                    departed.vacated_rooms.iter().cloned(),
                    PresenceState::Offline,
                )
                .await;
        }
        Some(departed)
    }

    /// Send an error envelope to the connection that caused `err`.
    pub async fn report_error(&self, id: &ConnectionId, err: &RelayError) {
        // Before authentication there is no identity to address, so the recipient is
        // the connection id the client was given in `hello`.
        let target = match self.registry.identity_of(id).await {
            Some(user) => Target::Direct(user),
            None => Target::Direct(UserId::new(id.as_str())),
        };
        let envelope = Envelope::error(target, err.code(), err);

        if let Err(send_err) = self
            .registry
            .send_to(id, OutboundFrame::envelope(envelope))
            .await
        {
            debug!(connection_id = %id, error = %send_err, "could not report error");
        }
    }

    async fn join(&self, id: &ConnectionId, room: RoomId) -> RelayResult<Inbound> {
        let user = self.require_identity(id).await?;
        let members = self.directory.members_of(&room).await?;
        if !members.contains(&user) {
            return Err(RelayError::NotRoomMember(room));
        }

        let outcome = self.registry.join_room(id, room.clone()).await?;
        self.registry
            .send_to(id, ServerEvent::Joined { room: room.clone() }.into())
            .await?;

        if outcome.first_for_user {
            self.presence
                .notify_presence_in(&user, [room.clone()], PresenceState::Online)
                .await;
        }
        Ok(Inbound::Joined(room))
    }

    async fn leave(&self, id: &ConnectionId, room: RoomId) -> RelayResult<Inbound> {
        let user = self.require_identity(id).await?;
        let vacated = self.registry.leave_room(id, &room).await?;
        self.registry
            .send_to(id, ServerEvent::Left { room: room.clone() }.into())
            .await?;

        if vacated {
            self.presence
                .notify_presence_in(&user, [room.clone()], PresenceState::Offline)
                .await;
        }
        Ok(Inbound::Left(room))
    }

    async fn route(&self, id: &ConnectionId, envelope: Envelope) -> RelayResult<Inbound> {
        let sender = self.require_identity(id).await?;

        match envelope.kind {
            MessageType::Chat => {
                if envelope.is_encrypted() && self.settings.verify_encrypted {
                    self.verify_integrity(&sender, &envelope).await?;
                }
                let result = self.dispatcher.dispatch(id, envelope).await?;
                Ok(Inbound::Delivered(result))
            }
            MessageType::Typing => {
                let state = TypingState::parse(&envelope.content).ok_or_else(|| {
                    RelayError::malformed("typing content must be started or stopped")
                })?;
                self.require_membership(id, &envelope.target).await?;
                self.presence
                    .notify_typing(&sender, &envelope.target, state)
                    .await;
                Ok(Inbound::Typing {
                    target: envelope.target,
                    state,
                })
            }
            MessageType::Presence => {
                let state = PresenceState::parse(&envelope.content).ok_or_else(|| {
                    RelayError::malformed("presence content must be online or offline")
                })?;
                self.require_membership(id, &envelope.target).await?;
                self.presence
                    .notify_presence_to(&sender, &envelope.target, state)
                    .await;
                Ok(Inbound::Presence)
            }
            MessageType::Error => Err(RelayError::malformed(
                "error envelopes are only sent by the relay",
            )),
        }
    }

    /// Decrypt to prove the ciphertext verifies; the envelope itself travels unchanged.
    async fn verify_integrity(&self, sender: &UserId, envelope: &Envelope) -> RelayResult<()> {
        let scope = match &envelope.target {
            Target::Room(room) => KeyScope::Room(room.clone()),
            Target::Direct(peer) => KeyScope::pair(sender.clone(), peer.clone()),
        };

        let Some(key) = self.keys.key_for(&scope).await? else {
            debug!(user_id = %sender, destination = %envelope.target, "no key on file, forwarding opaque");
            return Ok(());
        };

        open_envelope(envelope, &key).map(|_| ()).map_err(|err| {
            warn!(
                user_id = %sender,
                destination = %envelope.target,
                error = %err,
                "dropping encrypted envelope"
            );
            RelayError::from(err)
        })
    }

    async fn require_identity(&self, id: &ConnectionId) -> RelayResult<UserId> {
        self.registry
            .identity_of(id)
            .await
            .ok_or(RelayError::NotAuthenticated)
    }

    async fn require_membership(&self, id: &ConnectionId, target: &Target) -> RelayResult<()> {
        match target {
            Target::Room(room) if !self.registry.is_member(id, room).await => {
                Err(RelayError::NotRoomMember(room.clone()))
            }
            _ => Ok(()),
        }
    }
}
