use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::transport::TransportError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
    Immediate,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Fixed => "fixed",
            Self::Immediate => "immediate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "exponential" => Some(Self::Exponential),
            "linear" => Some(Self::Linear),
            "fixed" => Some(Self::Fixed),
            "immediate" => Some(Self::Immediate),
            _ => None,
        }
    }
}

/// Decides whether a failed attempt is tried again and how long to wait first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(1_000),
            multiplier: 2,
            max_delay: Duration::from_millis(60_000),
            jitter_min: Duration::from_millis(100),
            jitter_max: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used by tests and local tooling.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            strategy: BackoffStrategy::Immediate,
            base_delay: Duration::ZERO,
            multiplier: 1,
            max_delay: Duration::ZERO,
            jitter_min: Duration::ZERO,
            jitter_max: Duration::ZERO,
        }
    }

    /// `attempt` counts retries already made, starting at zero.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before retry number `attempt`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let raw = match self.strategy {
            BackoffStrategy::Exponential => {
                let factor = self.multiplier.max(1).saturating_pow(attempt);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt.saturating_add(1)),
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Immediate => Duration::ZERO,
        };
        raw.min(self.max_delay)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff(attempt) + self.jitter()
    }

    /// Delay before the next attempt, or `None` once the failure should go to fallback.
    pub fn next_delay(
        &self,
        attempt: u32,
        max_retries: u32,
        failure: &TransportError,
    ) -> Option<Duration> {
        if failure.is_transient() && attempt < max_retries && self.should_retry(attempt) {
            Some(self.delay_for(attempt))
        } else {
            None
        }
    }

    fn jitter(&self) -> Duration {
        let low = self.jitter_min.as_millis() as u64;
        let high = self.jitter_max.as_millis() as u64;
        if high <= low {
            return Duration::from_millis(low);
        }
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }
}
