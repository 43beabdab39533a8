use std::time::Duration;

use rand::Rng as _;

use super::config::TimeoutConfig;

/// Backoff schedule for reconnection attempts.
///
/// The delay starts at the configured floor plus jitter, then doubles (plus
/// fresh jitter) after every failed attempt until the growth cap is reached,
/// after which it stays constant. There is no attempt ceiling: the loop that
/// consumes this schedule keeps dialing until a dial succeeds or an interrupt
/// arrives.
pub(crate) struct Reconnector {
    delay: Duration,
    attempts: u32,
    random_range: u32,
    repeat_times: u32,
}

impl Reconnector {
    pub(crate) fn new(config: &TimeoutConfig) -> Self {
        Self {
            delay: config.retry_backoff_wait_minimum + jitter(config.retry_backoff_random_range),
            attempts: 1,
            random_range: config.retry_backoff_random_range,
            repeat_times: config.retry_backoff_repeat_times,
        }
    }

    pub(crate) fn delay(&self) -> Duration {
        self.delay
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Advances the schedule after a failed attempt.
    ///
    /// The delay grows only while the attempt counter is below the cap; the
    /// counter itself always advances. The first attempt uses the
    /// pre-computed initial delay and never re-enters the growth formula.
    pub(crate) fn record_failure(&mut self) {
        if self.attempts < self.repeat_times {
            self.delay = self.delay * 2 + jitter(self.random_range);
        }
        self.attempts += 1;
    }
}

/// Uniform whole-second jitter over `0..=range`.
fn jitter(range: u32) -> Duration {
    Duration::from_secs(u64::from(rand::rng().random_range(0..=range)))
}
