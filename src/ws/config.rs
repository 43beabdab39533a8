#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use crate::Result;
use crate::error::Error;

const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);
const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);
const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(54);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_BACKOFF_WAIT_MINIMUM: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_BACKOFF_RANDOM_RANGE: u32 = 15;
const DEFAULT_RETRY_BACKOFF_REPEAT_TIMES: u32 = 5;

/// Timeout and retry configuration for a [`Client`](super::Client).
///
/// Pass a custom value via
/// [`set_timeout_config`](super::Client::set_timeout_config) before starting
/// the client.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// Hard deadline for writing a single outbound frame
    pub write_wait: Duration,
    /// Maximum idle time without an inbound frame before the peer is declared
    /// dead. Zero disables read deadlines.
    pub pong_wait: Duration,
    /// Interval between outbound pings. Must stay strictly below `pong_wait`
    /// when `pong_wait` is non-zero. Zero disables the pinger.
    pub ping_period: Duration,
    /// Deadline for completing the HTTP upgrade handshake
    pub handshake_timeout: Duration,
    /// Delay floor for the first reconnection attempt
    pub retry_backoff_wait_minimum: Duration,
    /// Jitter range in whole seconds, re-sampled and added on every backoff
    /// step
    pub retry_backoff_random_range: u32,
    /// Attempt count after which the reconnection delay stops growing
    pub retry_backoff_repeat_times: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            write_wait: DEFAULT_WRITE_WAIT,
            pong_wait: DEFAULT_PONG_WAIT,
            ping_period: DEFAULT_PING_PERIOD,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            retry_backoff_wait_minimum: DEFAULT_RETRY_BACKOFF_WAIT_MINIMUM,
            retry_backoff_random_range: DEFAULT_RETRY_BACKOFF_RANDOM_RANGE,
            retry_backoff_repeat_times: DEFAULT_RETRY_BACKOFF_REPEAT_TIMES,
        }
    }
}

impl TimeoutConfig {
    /// A ping that cannot outrun the read deadline would close every session
    /// from the inside, so the combination is rejected up front.
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.pong_wait.is_zero() && self.ping_period >= self.pong_wait {
            return Err(Error::validation(format!(
                "ping_period ({:?}) must be strictly less than pong_wait ({:?})",
                self.ping_period, self.pong_wait
            )));
        }
        Ok(())
    }
}
