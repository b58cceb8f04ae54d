//! Reconnect delay schedule for the observer.

use std::time::Duration;

/// First reconnect delay.
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff doubling from an initial delay up to a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    ceiling: Duration,
    current: Duration,
    attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY)
    }
}

impl Backoff {
    /// Backoff starting at `initial` and never exceeding `ceiling`.
    #[must_use]
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        let initial = initial.min(ceiling);
        Self {
            initial,
            ceiling,
            current: initial,
            attempts: 0,
        }
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.ceiling);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Failed attempts since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Return to the initial delay after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}
