use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;

use super::config::ReconnectConfig;

/// Decides whether, and after what delay, a dropped transport is re-opened.
///
/// One policy value tracks one "intent to stay connected" session. The attempt counter only
/// grows until [`ReconnectPolicy::reset`] is called after a successful open.
#[derive(Debug)]
pub struct ReconnectPolicy {
    max_attempts: Option<u32>,
    attempts: u32,
    backoff: ExponentialBackoff,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            attempts: 0,
            backoff: config.clone().into(),
        }
    }

    /// Delay before the next attempt, or `None` once the attempt budget is spent.
    ///
    /// Attempt `n` (1-indexed) waits `initial_backoff * multiplier^(n-1)`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let delay = self.backoff.next_backoff()?;
        self.attempts = self.attempts.saturating_add(1);
        Some(delay)
    }

    /// Called after a successful open.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.backoff.reset();
    }

    /// Number of attempts scheduled since the last successful open.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempts >= max)
    }
}
