//! Reconnection policy for the event channel.
//!
//! The first retry waits [`ReconnectConfig::initial_delay`]; each further
//! retry multiplies the delay by [`ReconnectConfig::multiplier`] up to
//! [`ReconnectConfig::max_delay`]. A multiplier of `1.0` gives a fixed
//! delay. After [`ReconnectConfig::max_attempts`] failed retries the
//! connection gives up and reports `Failed`. A single attempt that has not
//! opened within [`ReconnectConfig::connect_timeout`] counts as failed.

use std::time::Duration;

/// Tunable parameters for the retry strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Retry at all after a failure or drop.
    pub auto_reconnect: bool,
    /// Retry budget before the connection is declared failed.
    pub max_attempts: u32,
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: 5,
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            multiplier: 1.0,
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl ReconnectConfig {
    /// Whether another retry is allowed after `attempt` retries so far.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.auto_reconnect && attempt < self.max_attempts
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}
