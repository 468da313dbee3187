//! Envelope routing and fan-out.
//!
//! Recipient resolution and enqueueing happen under a per-room lock, so two
//! envelopes dispatched to the same room reach every recipient queue in the same
//! order. Enqueueing is `try_send` on a bounded queue: a slow reader never stalls
//! the room, its failure is recorded for that connection only.

use parley_protocol::{Envelope, MessageType, OutboundFrame, RoomId, Target, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::collaborators::OfflineStore;
use crate::error::{RelayError, RelayResult};
use crate::registry::{permitted_before_auth, ConnectionId, ConnectionRegistry, Recipient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The connection's writer has gone away.
    Closed,
    /// The connection's queue is full.
    Backpressure,
    /// The connection may not receive this frame before authenticating.
    Refused,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryResult {
    pub outcomes: Vec<(ConnectionId, DeliveryOutcome)>,
    /// True when no live connection existed and the offline store accepted the envelope.
    pub handed_off: bool,
}

impl DeliveryResult {
    pub fn delivered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == DeliveryOutcome::Delivered)
            .count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &(ConnectionId, DeliveryOutcome)> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome != DeliveryOutcome::Delivered)
    }

    /// Some recipients did not get the envelope. Informational; the sender is not failed.
    pub fn partial_failure(&self) -> bool {
        self.failed().next().is_some()
    }

    pub fn outcome_for(&self, id: &ConnectionId) -> Option<DeliveryOutcome> {
        self.outcomes
            .iter()
            .find(|(connection, _)| connection == id)
            .map(|(_, outcome)| *outcome)
    }
}

/// Connections left out of a room fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclude {
    Nobody,
    Connection(ConnectionId),
    User(UserId),
}

impl Exclude {
    fn skips(&self, recipient: &Recipient) -> bool {
        match self {
            Self::Nobody => false,
            Self::Connection(id) => recipient.connection_id == *id,
            Self::User(user) => recipient.identity.as_ref() == Some(user),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    /// Deliver room envelopes back to the originating connection.
    pub echo_to_sender: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            echo_to_sender: true,
        }
    }
}

pub struct Dispatcher {
    registry: ConnectionRegistry,
    offline: Option<Arc<dyn OfflineStore>>,
    options: DispatchOptions,
    room_locks: StdMutex<HashMap<RoomId, Arc<Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(
        registry: ConnectionRegistry,
        offline: Option<Arc<dyn OfflineStore>>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            registry,
            offline,
            options,
            room_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub async fn dispatch(
        &self,
        origin: &ConnectionId,
        envelope: Envelope,
    ) -> RelayResult<DeliveryResult> {
        self.dispatch_with(origin, envelope, self.options).await
    }

    /// Route an envelope from `origin` to every live connection of its target.
    ///
    /// The sender field is replaced with the origin's authenticated identity.
    pub async fn dispatch_with(
        &self,
        origin: &ConnectionId,
        envelope: Envelope,
        options: DispatchOptions,
    ) -> RelayResult<DeliveryResult> {
        let sender = self
            .registry
            .identity_of(origin)
            .await
            .ok_or(RelayError::NotAuthenticated)?;
        let envelope = envelope.with_sender(sender);

        let result = match envelope.target.clone() {
            Target::Direct(user) => self.send_to_user(&user, envelope).await,
            Target::Room(room) => {
                if !self.registry.is_member(origin, &room).await {
                    return Err(RelayError::NotRoomMember(room));
                }
                let exclude = if options.echo_to_sender {
                    Exclude::Nobody
                } else {
                    Exclude::Connection(origin.clone())
                };
                self.broadcast_room(&room, envelope, exclude).await
            }
        };

        if result.partial_failure() {
            debug!(
                connection_id = %origin,
                delivered = result.delivered(),
                failed = result.failed().count(),
                "partial delivery"
            );
        }
        Ok(result)
    }

    /// Fan an envelope out to everyone currently in `room`.
    pub async fn broadcast_room(
        &self,
        room: &RoomId,
        envelope: Envelope,
        exclude: Exclude,
    ) -> DeliveryResult {
        let lock = self.room_lock(room);
        let outcomes = {
            let _guard = lock.lock().await;
            let recipients = self.registry.room_recipients(room).await;
            let frame = OutboundFrame::envelope(envelope);
            deliver(
                recipients.iter().filter(|recipient| !exclude.skips(recipient)),
                &frame,
            )
        };
        self.release_room_lock(room, lock);

        DeliveryResult {
            outcomes,
            handed_off: false,
        }
    }

    /// Deliver to every live connection of `user`, handing off to the offline store
    /// when there are none.
    pub async fn send_to_user(&self, user: &UserId, envelope: Envelope) -> DeliveryResult {
        let recipients = self.registry.user_recipients(user).await;
        if recipients.is_empty() {
            let handed_off = self.hand_off(&envelope).await;
            return DeliveryResult {
                outcomes: Vec::new(),
                handed_off,
            };
        }

        let frame = OutboundFrame::envelope(envelope);
        DeliveryResult {
            outcomes: deliver(recipients.iter(), &frame),
            handed_off: false,
        }
    }

    async fn hand_off(&self, envelope: &Envelope) -> bool {
        let Some(store) = &self.offline else {
            return false;
        };
        // Typing and presence are never stored.
        if envelope.kind != MessageType::Chat {
            return false;
        }

        match store.persist(envelope).await {
            Ok(()) => {
                debug!(destination = %envelope.target, "envelope handed to offline store");
                true
            }
            Err(err) => {
                warn!(destination = %envelope.target, error = %err, "offline hand-off failed");
                false
            }
        }
    }

    fn room_lock(&self, room: &RoomId) -> Arc<Mutex<()>> {
        let mut locks = self
            .room_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(room.clone()).or_default().clone()
    }

    fn release_room_lock(&self, room: &RoomId, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self
            .room_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(room)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(room);
        }
    }

    #[cfg(test)]
    fn tracked_room_locks(&self) -> usize {
        self.room_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

fn deliver<'a>(
    recipients: impl Iterator<Item = &'a Recipient>,
    frame: &OutboundFrame,
) -> Vec<(ConnectionId, DeliveryOutcome)> {
    recipients
        .map(|recipient| {
            let outcome = if !recipient.is_authenticated() && !permitted_before_auth(frame) {
                DeliveryOutcome::Refused
            } else {
                match recipient.outbound().try_send(frame.clone()) {
                    Ok(()) => DeliveryOutcome::Delivered,
                    Err(TrySendError::Full(_)) => {
                        warn!(connection_id = %recipient.connection_id, "outbound queue full");
                        DeliveryOutcome::Backpressure
                    }
                    Err(TrySendError::Closed(_)) => DeliveryOutcome::Closed,
                }
            };
            (recipient.connection_id.clone(), outcome)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MemoryOfflineStore;
    use tokio::sync::mpsc;

    async fn connect(
        registry: &ConnectionRegistry,
        id: &str,
        user: &str,
        capacity: usize,
    ) -> (ConnectionId, mpsc::Receiver<OutboundFrame>) {
        let id = ConnectionId::from(id);
        let (tx, rx) = mpsc::channel(capacity);
        registry.attach(id.clone(), tx).await.unwrap();
        registry.register(&id, UserId::from(user)).await.unwrap();
        (id, rx)
    }

    #[tokio::test]
    async fn sender_is_stamped_from_the_connection_identity() {
        let registry = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone(), None, DispatchOptions::default());
        let (alice, _a) = connect(&registry, "A", "alice", 4).await;
        let (_bob, mut b) = connect(&registry, "B", "bob", 4).await;

        let forged = Envelope::chat(Target::Direct(UserId::from("bob")), "hi")
            .with_sender(UserId::from("mallory"));
        let result = dispatcher.dispatch(&alice, forged).await.unwrap();
        assert_eq!(result.delivered(), 1);

        let frame = b.recv().await.unwrap();
        assert_eq!(
            frame.as_envelope().unwrap().sender,
            Some(UserId::from("alice"))
        );
    }

    #[tokio::test]
    async fn full_queue_is_reported_per_connection() {
        let registry = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone(), None, DispatchOptions::default());
        let (alice, _a) = connect(&registry, "A", "alice", 4).await;
        let (slow, _s) = connect(&registry, "S", "bob", 1).await;
        let (fast, mut f) = connect(&registry, "F", "bob", 4).await;

        let room = RoomId::from("R");
        for id in [&alice, &slow, &fast] {
            registry.join_room(id, room.clone()).await.unwrap();
        }

        let first = dispatcher
            .dispatch(&alice, Envelope::chat(Target::Room(room.clone()), "one"))
            .await
            .unwrap();
        assert!(!first.partial_failure());

        let second = dispatcher
            .dispatch(&alice, Envelope::chat(Target::Room(room.clone()), "two"))
            .await
            .unwrap();
        assert!(second.partial_failure());
        assert_eq!(
            second.outcome_for(&slow),
            Some(DeliveryOutcome::Backpressure)
        );
        assert_eq!(second.outcome_for(&fast), Some(DeliveryOutcome::Delivered));

        assert_eq!(f.recv().await.unwrap().as_envelope().unwrap().content, "one");
        assert_eq!(f.recv().await.unwrap().as_envelope().unwrap().content, "two");
    }

    #[tokio::test]
    async fn closed_writer_is_reported_as_closed() {
        let registry = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone(), None, DispatchOptions::default());
        let (alice, _a) = connect(&registry, "A", "alice", 4).await;
        let (bob, b) = connect(&registry, "B", "bob", 4).await;
        drop(b);

        let result = dispatcher
            .dispatch(&alice, Envelope::chat(Target::Direct(UserId::from("bob")), "hi"))
            .await
            .unwrap();
        assert_eq!(result.outcome_for(&bob), Some(DeliveryOutcome::Closed));
        assert!(!result.handed_off);
    }

    #[tokio::test]
    async fn non_member_cannot_post_to_room() {
        let registry = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone(), None, DispatchOptions::default());
        let (alice, _a) = connect(&registry, "A", "alice", 4).await;

        let result = dispatcher
            .dispatch(&alice, Envelope::chat(Target::Room(RoomId::from("R")), "hi"))
            .await;
        assert!(matches!(result, Err(RelayError::NotRoomMember(_))));
    }

    #[tokio::test]
    async fn only_chat_is_handed_off() {
        let registry = ConnectionRegistry::new();
        let store = Arc::new(MemoryOfflineStore::new());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            Some(store.clone()),
            DispatchOptions::default(),
        );
        let carol = UserId::from("carol");

        let typing = Envelope::new(MessageType::Typing, Target::Direct(carol.clone()), "started");
        assert!(!dispatcher.send_to_user(&carol, typing).await.handed_off);

        let chat = Envelope::chat(Target::Direct(carol.clone()), "later");
        assert!(dispatcher.send_to_user(&carol, chat).await.handed_off);
        assert_eq!(store.stored().await.len(), 1);
    }

    #[tokio::test]
    async fn idle_room_locks_are_released() {
        let registry = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone(), None, DispatchOptions::default());
        let (alice, _a) = connect(&registry, "A", "alice", 4).await;
        let room = RoomId::from("R");
        registry.join_room(&alice, room.clone()).await.unwrap();

        dispatcher
            .dispatch(&alice, Envelope::chat(Target::Room(room), "hi"))
            .await
            .unwrap();
        assert_eq!(dispatcher.tracked_room_locks(), 0);
    }
}
