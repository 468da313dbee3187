use std::time::Duration;

/// Reconnect delays that double from `initial` up to `max`.
///
/// With a retry limit set, [`Backoff::next_delay`] returns `None` once that many
/// consecutive attempts have failed. A successful connection calls
/// [`Backoff::reset`].
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
    max_attempts: Option<u32>,
}

impl Backoff {
    pub const INITIAL: Duration = Duration::from_secs(1);
    pub const MAX: Duration = Duration::from_secs(60);

    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
            attempts: 0,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|limit| self.attempts >= limit) {
            return None;
        }
        self.attempts += 1;

        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Self::INITIAL, Self::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(values: &[u64]) -> Vec<Option<Duration>> {
        values.iter().map(|s| Some(Duration::from_secs(*s))).collect()
    }

    #[test]
    fn delays_double_until_capped() {
        let mut backoff = Backoff::default();
        let delays: Vec<_> = (0..8).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays, secs(&[1, 2, 4, 8, 16, 32, 60, 60]));
    }

    #[test]
    fn reset_starts_the_schedule_over() {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(1));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn retry_limit_gives_up() {
        let mut backoff = Backoff::default().with_max_attempts(Some(2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert!(backoff.next_delay().is_some());
    }
}
