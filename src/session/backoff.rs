//! Exponential backoff for readiness polling.

use std::time::Duration;

/// Poll interval policy: start at `initial`, double after every attempt,
/// never exceed `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// First delay.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            ceiling: Duration::from_millis(200),
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy. An `initial` above `ceiling` is clamped to it.
    #[must_use]
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            initial: initial.min(ceiling),
            ceiling,
        }
    }

    /// Returns a fresh delay sequence for one wait.
    #[must_use]
    pub fn delays(&self) -> Backoff {
        Backoff {
            next: self.initial.min(self.ceiling),
            ceiling: self.ceiling,
        }
    }
}

/// An endless sequence of delays produced by a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    ceiling: Duration,
}

impl Backoff {
    /// Returns the current delay and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = self.next.saturating_mul(2).min(self.ceiling);
        current
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}
