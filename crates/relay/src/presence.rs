//! Typing and presence signals.
//!
//! Both are best-effort: nothing is returned to the caller and a failed delivery
//! is only logged at debug.

use parley_protocol::{Envelope, PresenceState, RoomId, Target, TypingState, UserId};
use std::sync::Arc;
use tracing::debug;

use crate::dispatcher::{DeliveryResult, Dispatcher, Exclude};

#[derive(Clone)]
pub struct PresenceNotifier {
    dispatcher: Arc<Dispatcher>,
}

impl PresenceNotifier {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Tell the target that `user` started or stopped typing. The typist's own
    /// connections are never notified.
    pub async fn notify_typing(&self, user: &UserId, target: &Target, state: TypingState) {
        let envelope = Envelope::typing(user.clone(), target.clone(), state);
        let result = match target {
            Target::Room(room) => {
                self.dispatcher
                    .broadcast_room(room, envelope, Exclude::User(user.clone()))
                    .await
            }
            Target::Direct(peer) if peer == user => return,
            Target::Direct(peer) => self.dispatcher.send_to_user(peer, envelope).await,
        };

        log_outcome("typing", user, target, &result);
    }

    /// Announce a presence change to every room the user currently occupies.
    pub async fn notify_presence(&self, user: &UserId, state: PresenceState) {
        let rooms = self.dispatcher.registry().rooms_of_user(user).await;
        self.notify_presence_in(user, rooms, state).await;
    }

    /// Announce a presence change to an explicit set of rooms. Used once the user's
    /// connections are already gone from the registry.
    pub async fn notify_presence_in(
        &self,
        user: &UserId,
        rooms: impl IntoIterator<Item = RoomId>,
        state: PresenceState,
    ) {
        for room in rooms {
            let target = Target::Room(room);
            self.notify_presence_to(user, &target, state).await;
        }
    }

    /// Relay a presence signal to a single target.
    pub async fn notify_presence_to(&self, user: &UserId, target: &Target, state: PresenceState) {
        let envelope = Envelope::presence(user.clone(), target.clone(), state);
        let result = match target {
            Target::Room(room) => {
                self.dispatcher
                    .broadcast_room(room, envelope, Exclude::User(user.clone()))
                    .await
            }
            Target::Direct(peer) => self.dispatcher.send_to_user(peer, envelope).await,
        };

        log_outcome("presence", user, target, &result);
    }
}

fn log_outcome(signal: &'static str, user: &UserId, target: &Target, result: &DeliveryResult) {
    if result.partial_failure() {
        debug!(
            signal,
            user_id = %user,
            destination = %target,
            failed = result.failed().count(),
            "signal not delivered to every connection"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatchOptions;
    use crate::registry::{ConnectionId, ConnectionRegistry};
    use parley_protocol::{MessageType, OutboundFrame};
    use tokio::sync::mpsc;

    struct Fixture {
        registry: ConnectionRegistry,
        notifier: PresenceNotifier,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = ConnectionRegistry::new();
            let dispatcher = Arc::new(Dispatcher::new(
                registry.clone(),
                None,
                DispatchOptions::default(),
            ));
            Self {
                registry,
                notifier: PresenceNotifier::new(dispatcher),
            }
        }

        async fn connect(
            &self,
            id: &str,
            user: &str,
            room: &str,
        ) -> mpsc::Receiver<OutboundFrame> {
            let id = ConnectionId::from(id);
            let (tx, rx) = mpsc::channel(8);
            self.registry.attach(id.clone(), tx).await.unwrap();
            self.registry.register(&id, UserId::from(user)).await.unwrap();
            self.registry.join_room(&id, RoomId::from(room)).await.unwrap();
            rx
        }
    }

    #[tokio::test]
    async fn typing_skips_every_connection_of_the_typist() {
        let fixture = Fixture::new();
        let mut a1 = fixture.connect("A1", "alice", "R").await;
        let mut a2 = fixture.connect("A2", "alice", "R").await;
        let mut b1 = fixture.connect("B1", "bob", "R").await;

        fixture
            .notifier
            .notify_typing(
                &UserId::from("alice"),
                &Target::Room(RoomId::from("R")),
                TypingState::Started,
            )
            .await;

        let frame = b1.try_recv().unwrap();
        let envelope = frame.as_envelope().unwrap();
        assert_eq!(envelope.kind, MessageType::Typing);
        assert_eq!(envelope.content, "started");
        assert!(a1.try_recv().is_err());
        assert!(a2.try_recv().is_err());
    }

    #[tokio::test]
    async fn presence_reaches_every_room_the_user_occupies() {
        let fixture = Fixture::new();
        let _a = fixture.connect("A1", "alice", "R1").await;
        fixture
            .registry
            .join_room(&ConnectionId::from("A1"), RoomId::from("R2"))
            .await
            .unwrap();
        let mut b = fixture.connect("B1", "bob", "R1").await;
        let mut c = fixture.connect("C1", "carol", "R2").await;

        fixture
            .notifier
            .notify_presence(&UserId::from("alice"), PresenceState::Offline)
            .await;

        for rx in [&mut b, &mut c] {
            let frame = rx.try_recv().unwrap();
            let envelope = frame.as_envelope().unwrap();
            assert_eq!(envelope.kind, MessageType::Presence);
            assert_eq!(envelope.content, "offline");
            assert_eq!(envelope.sender, Some(UserId::from("alice")));
        }
    }

    #[tokio::test]
    async fn typing_to_an_offline_peer_is_dropped_silently() {
        let fixture = Fixture::new();
        fixture
            .notifier
            .notify_typing(
                &UserId::from("alice"),
                &Target::Direct(UserId::from("nobody")),
                TypingState::Stopped,
            )
            .await;
        assert_eq!(fixture.registry.connection_count().await, 0);
    }
}
