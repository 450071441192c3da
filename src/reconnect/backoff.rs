//! Exponential backoff for reconnection delays
//!
//! Pure delay arithmetic with no timers or shared state. The attempt counter
//! lives in [`super::strategy::BackoffReconnectionStrategy`].

use crate::config::ReconnectSection;
use crate::error::SessionError;
use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff: `base * 2^attempt`, clamped to `max_delay`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl BackoffPolicy {
    /// Build a policy, rejecting zero delays up front
    pub fn new(base: Duration, max_delay: Duration) -> Result<Self, SessionError> {
        if max_delay.is_zero() {
            return Err(SessionError::InvalidConfig(
                "max_delay must be greater than 0".to_string(),
            ));
        }
        if base.is_zero() {
            return Err(SessionError::InvalidConfig(
                "base delay must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            base,
            max_delay,
            jitter: false,
        })
    }

    /// Build a policy from the `[reconnect]` config section
    pub fn from_config(config: &ReconnectSection) -> Result<Self, SessionError> {
        Ok(Self::new(config.base_delay(), config.max_delay())?.with_jitter(config.jitter))
    }

    /// Enable or disable equal jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    /// Deterministic delay for `attempt`, saturating at `max_delay`
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// With jitter enabled the result is drawn from `[d/2, d]` where `d` is
    /// [`capped_delay`](Self::capped_delay), so it never exceeds `max_delay`.
    /// Monotonicity across attempts only holds without jitter.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.capped_delay(attempt);
        if !self.jitter {
            return delay;
        }

        let floor = delay / 2;
        rand::rng().random_range(floor..=delay)
    }
}
