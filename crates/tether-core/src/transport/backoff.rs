//! Reconnect timing for transports that retry.
//!
//! The communication layer never decides when a transport reconnects. A
//! transport that retries asks its [`ReconnectPolicy`] for the delay before
//! each attempt; [`ExponentialBackoff`] is the default.

use crate::config::TransportConfig;
use rand::Rng;
use std::time::Duration;

/// Decides how long to wait before a reconnect attempt.
pub trait ReconnectPolicy: Send + Sync {
    /// Delay before attempt `attempt` (0-indexed, reset after each successful connect).
    ///
    /// Returning `None` stops reconnecting.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Exponential base (typically 2.0 for doubling).
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
    /// Give up after this many consecutive failed attempts.
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: TransportConfig::RECONNECT_BASE_DELAY,
            max_delay: TransportConfig::RECONNECT_MAX_DELAY,
            exponential_base: 2.0,
            jitter: true,
            max_attempts: None,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }

        let multiplier = self.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            // Factor in [0.5, 1.5) keeps the mean while avoiding near-zero delays
            let jitter_factor = rand::rng().random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Some(Duration::from_secs_f64(final_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_calculation_no_jitter() {
        let policy = ExponentialBackoff::new()
            .with_base_delay(Duration::from_secs(1))
            .with_jitter(false);

        assert_eq!(policy.next_delay(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = ExponentialBackoff::new()
            .with_base_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter(false);

        assert_eq!(policy.next_delay(3), Some(Duration::from_secs(30)));
        assert_eq!(policy.next_delay(500), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_delay_with_jitter_stays_in_range() {
        let policy = ExponentialBackoff::new()
            .with_base_delay(Duration::from_secs(2))
            .with_jitter(true);

        for _ in 0..20 {
            let delay = policy.next_delay(0).unwrap();
            assert!(
                delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3),
                "Delay {:?} should be between 1s and 3s",
                delay
            );
        }
    }

    #[test]
    fn test_max_attempts_stops_reconnecting() {
        let policy = ExponentialBackoff::new().with_max_attempts(2);
        assert!(policy.next_delay(0).is_some());
        assert!(policy.next_delay(1).is_some());
        assert!(policy.next_delay(2).is_none());
    }
}
