#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use rand::Rng;

use crate::Result;
use crate::error::Error;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(70);
const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_BASE_DELAY_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_JITTER_FACTOR: f64 = 0.3;

/// Configuration for WebSocket client behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval for sending `ping` frames while connected
    pub heartbeat_interval: Duration,
    /// Maximum time since the last `pong` before the connection is considered dead
    pub heartbeat_timeout: Duration,
    /// Upper bound on a single connection attempt, from dialing to the socket being open
    pub connect_timeout: Duration,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_DURATION,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Config {
    /// Set the heartbeat interval and missed-acknowledgment threshold.
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reconnection policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::validation("heartbeat_interval must be non-zero"));
        }
        if self.heartbeat_timeout < self.heartbeat_interval {
            return Err(Error::validation(
                "heartbeat_timeout must not be shorter than heartbeat_interval",
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::validation("connect_timeout must be non-zero"));
        }
        self.reconnect.validate()
    }
}

/// Configuration for automatic reconnection behavior.
///
/// The delay before retry `n` (zero-based) is `min(base_delay * 2^n, max_delay)`
/// plus a uniformly random jitter in `[0, delay * jitter_factor)`.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Delay before the first reconnection attempt, before jitter
    pub base_delay: Duration,
    /// Upper bound on the delay before jitter
    pub max_delay: Duration,
    /// Fraction of the delay used as the upper bound for additive jitter
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None, // Infinite reconnection by default
            base_delay: DEFAULT_BASE_DELAY_DURATION,
            max_delay: DEFAULT_MAX_DELAY_DURATION,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl ReconnectConfig {
    /// Stop retrying after `max_attempts` scheduled reconnects.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the base and maximum delay.
    #[must_use]
    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Set the jitter factor. `0.0` disables jitter.
    #[must_use]
    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Delay before jitter for the given zero-based attempt.
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        2_u32
            .checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Exclusive upper bound of the jitter added on top of `delay`.
    #[must_use]
    pub fn jitter_bound(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.jitter_factor)
    }

    /// Full delay (including jitter) for the given attempt, drawn from `rng`.
    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay_for(attempt);
        let bound = self.jitter_bound(delay);
        if bound.is_zero() {
            return delay;
        }
        delay.saturating_add(rng.random_range(Duration::ZERO..bound))
    }

    /// Full delay (including jitter) for the given attempt using the thread-local RNG.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::rng())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(Error::validation("jitter_factor must be within [0.0, 1.0]"));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::validation("base_delay must not exceed max_delay"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn base_delay_doubles_per_attempt() {
        let config = ReconnectConfig::default();

        assert_eq!(config.base_delay_for(0), Duration::from_millis(1000));
        assert_eq!(config.base_delay_for(1), Duration::from_millis(2000));
        assert_eq!(config.base_delay_for(2), Duration::from_millis(4000));
    }

    #[test]
    fn base_delay_respects_max() {
        let config = ReconnectConfig::default();

        assert_eq!(config.base_delay_for(5), Duration::from_secs(30));
        assert_eq!(config.base_delay_for(31), Duration::from_secs(30));
        assert_eq!(config.base_delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let config = ReconnectConfig::default();
        let mut rng = StdRng::seed_from_u64(7);

        for attempt in 0..12 {
            let base = config.base_delay_for(attempt);
            let bound = config.jitter_bound(base);
            for _ in 0..200 {
                let delay = config.delay_with(attempt, &mut rng);
                assert!(delay >= base, "delay {delay:?} below base {base:?}");
                assert!(delay < base + bound, "delay {delay:?} exceeds jitter bound");
            }
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let config = ReconnectConfig::default().with_jitter_factor(0.0);

        assert_eq!(config.delay_for(1), Duration::from_secs(2));
    }

    #[test]
    fn defaults_match_reference_policy() {
        let config = Config::default();

        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(70));
        assert_eq!(config.reconnect.max_attempts, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn negative_jitter_is_rejected() {
        let config = Config::default().with_reconnect(ReconnectConfig::default().with_jitter_factor(-1.0));

        assert!(config.validate().is_err());
    }

    #[test]
    fn heartbeat_timeout_below_interval_is_rejected() {
        let config =
            Config::default().with_heartbeat(Duration::from_secs(30), Duration::from_secs(20));

        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::Validation);

        let equal =
            Config::default().with_heartbeat(Duration::from_secs(30), Duration::from_secs(30));
        assert!(equal.validate().is_ok());
    }
}
