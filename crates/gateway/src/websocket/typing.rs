use parley_protocol::{Target, TypingState};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Per-connection typing deadlines.
///
/// A `started` signal that is not refreshed within the quiescence window is turned
/// into a synthetic `stopped` by the connection loop.
#[derive(Debug)]
pub struct TypingDebounce {
    quiescence: Duration,
    deadlines: HashMap<Target, Instant>,
}

impl TypingDebounce {
    pub fn new(quiescence: Duration) -> Self {
        Self {
            quiescence,
            deadlines: HashMap::new(),
        }
    }

    pub fn observe(&mut self, target: Target, state: TypingState, now: Instant) {
        match state {
            TypingState::Started => {
                self.deadlines.insert(target, now + self.quiescence);
            }
            TypingState::Stopped => {
                self.deadlines.remove(&target);
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every target whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Target> {
        let expired: Vec<Target> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(target, _)| target.clone())
            .collect();
        for target in &expired {
            self.deadlines.remove(target);
        }
        expired
    }

    pub fn drain(&mut self) -> Vec<Target> {
        self.deadlines.drain().map(|(target, _)| target).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::{RoomId, UserId};

    fn room(name: &str) -> Target {
        Target::Room(RoomId::from(name))
    }

    #[test]
    fn refreshed_typing_pushes_the_deadline_out() {
        let start = Instant::now();
        let mut typing = TypingDebounce::new(Duration::from_secs(5));

        typing.observe(room("ops"), TypingState::Started, start);
        typing.observe(room("ops"), TypingState::Started, start + Duration::from_secs(3));

        assert_eq!(typing.next_deadline(), Some(start + Duration::from_secs(8)));
        assert!(typing.take_expired(start + Duration::from_secs(6)).is_empty());
        assert_eq!(
            typing.take_expired(start + Duration::from_secs(8)),
            vec![room("ops")]
        );
        assert!(typing.is_empty());
    }

    #[test]
    fn explicit_stop_clears_the_deadline() {
        let start = Instant::now();
        let mut typing = TypingDebounce::new(Duration::from_secs(5));

        typing.observe(room("ops"), TypingState::Started, start);
        typing.observe(Target::Direct(UserId::from("bob")), TypingState::Started, start);
        typing.observe(room("ops"), TypingState::Stopped, start);

        assert_eq!(typing.drain(), vec![Target::Direct(UserId::from("bob"))]);
        assert_eq!(typing.next_deadline(), None);
    }
}
