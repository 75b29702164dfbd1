//! Reconnection policy: bounded, increasing delay between attempts.
//!
//! The supervisor loop in [`crate::channel`] drives this policy whenever a
//! channel drops out of READY without an explicit `disconnect()`. Delays
//! grow linearly (`base_delay * attempt`), capped at `max_delay`; after
//! `max_attempts` failures the policy reports exhaustion and automatic
//! retry stops until the owner reconnects explicitly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay unit multiplied by the attempt number.
    pub base_delay: Duration,
    /// Ceiling on the computed delay.
    pub max_delay: Duration,
    /// Attempts before giving up. Must be at least 1.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

/// Tracks attempts across one outage and yields the next delay.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once attempts are
    /// exhausted. The first call (attempt 1) waits one base delay.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;
        let delay = self
            .config
            .base_delay
            .checked_mul(self.attempt)
            .unwrap_or(self.config.max_delay);
        Some(delay.min(self.config.max_delay))
    }

    /// A successful connect ends the outage.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, cap_ms: u64, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(cap_ms),
            max_attempts,
        })
    }

    #[test]
    fn delays_increase_linearly_until_cap() {
        let mut p = policy(100, 250, 10);
        assert_eq!(p.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(p.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(p.next_delay(), Some(Duration::from_millis(250)));
        assert_eq!(p.next_delay(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn delays_are_non_decreasing() {
        let mut p = policy(50, 10_000, 20);
        let mut last = Duration::ZERO;
        while let Some(d) = p.next_delay() {
            assert!(d >= last);
            last = d;
        }
        assert_eq!(p.attempts(), 20);
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let mut p = policy(10, 100, 3);
        assert!(p.next_delay().is_some());
        assert!(p.next_delay().is_some());
        assert!(p.next_delay().is_some());
        assert!(p.next_delay().is_none());
        assert!(p.exhausted());
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut p = policy(10, 100, 3);
        p.next_delay();
        p.next_delay();
        p.reset();
        assert_eq!(p.attempts(), 0);
        assert!(!p.exhausted());
        assert_eq!(p.next_delay(), Some(Duration::from_millis(10)));
    }
}
