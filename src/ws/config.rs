#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::backoff::Backoff;

const DEFAULT_RECONNECT_INTERVAL_DURATION: Duration = Duration::from_millis(3000);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_MAX_BACKOFF_MULTIPLIER: u32 = 5;
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(15);

/// Configuration for WebSocket client behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval for sending protocol PING frames. `None` disables the heartbeat.
    pub heartbeat_interval: Option<Duration>,
    /// Maximum time to wait for PONG response before considering connection dead
    pub heartbeat_timeout: Duration,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: None,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Configuration for automatic reconnection behavior.
///
/// The delay before attempt `n` is `interval * min(n, max_multiplier)`.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Base delay between reconnection attempts
    pub interval: Duration,
    /// Maximum number of consecutive reconnection attempts before giving up
    pub max_attempts: u32,
    /// Cap on the attempt multiplier applied to `interval`
    pub max_multiplier: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONNECT_INTERVAL_DURATION,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            max_multiplier: DEFAULT_MAX_BACKOFF_MULTIPLIER,
        }
    }
}

impl From<ReconnectConfig> for LinearBackoff {
    fn from(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }
}

/// Linearly growing, capped reconnect delay with a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    config: ReconnectConfig,
    attempts: u32,
}

impl LinearBackoff {
    /// Number of reconnects scheduled since the last successful open.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the attempt budget has been spent.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.attempts >= self.config.max_attempts
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        self.attempts += 1;
        let multiplier = self.attempts.min(self.config.max_multiplier);
        Some(self.config.interval.saturating_mul(multiplier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_is_linear_and_capped() {
        let mut backoff: LinearBackoff = ReconnectConfig::default().into();

        let delays: Vec<u128> = (0..6)
            .map(|_| backoff.next_backoff().unwrap().as_millis())
            .collect();

        assert_eq!(delays, vec![3000, 6000, 9000, 12000, 15000, 15000]);
        assert_eq!(backoff.attempts(), 6);
    }

    #[test]
    fn backoff_stops_after_max_attempts() {
        let config = ReconnectConfig {
            interval: Duration::from_millis(10),
            max_attempts: 3,
            max_multiplier: 5,
        };
        let mut backoff: LinearBackoff = config.into();

        for _ in 0..3 {
            assert!(backoff.next_backoff().is_some());
        }

        assert!(backoff.is_exhausted());
        assert_eq!(backoff.next_backoff(), None);
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut backoff: LinearBackoff = ReconnectConfig::default().into();
        let _first = backoff.next_backoff();
        let _second = backoff.next_backoff();

        backoff.reset();

        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(3000)));
    }

    #[test]
    fn default_config_matches_dashboard_defaults() {
        let config = Config::default();

        assert_eq!(config.reconnect.interval, Duration::from_millis(3000));
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.heartbeat_interval, None);
    }
}
