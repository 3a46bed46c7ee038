use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{QueueError, QueueResult};

/// Engine default for the exponential backoff ceiling, as a multiple of the base
pub const DEFAULT_CEILING_FACTOR: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Constant `backoff_base` between attempts
    Fixed,
    /// `backoff_base * 2^(attempt-1)`, capped at `backoff_base * ceiling_factor`
    Exponential,
}

/// Retry policy, copied onto every job at enqueue time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total execution attempts allowed, including the first one
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_kind: BackoffKind,
    pub ceiling_factor: u32,
    /// Fraction in `[0, 1)`; zero disables jitter
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(1000))
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base,
            backoff_kind: BackoffKind::Exponential,
            ceiling_factor: DEFAULT_CEILING_FACTOR,
            jitter_fraction: 0.0,
        }
    }

    pub fn fixed(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            backoff_kind: BackoffKind::Fixed,
            ..Self::exponential(max_attempts, backoff_base)
        }
    }

    /// No retries: the first failure is final
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn with_ceiling_factor(mut self, factor: u32) -> Self {
        self.ceiling_factor = factor;
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.max_attempts < 1 {
            return Err(QueueError::config("retry policy needs max_attempts >= 1"));
        }
        if self.backoff_kind == BackoffKind::Exponential && self.backoff_base.is_zero() {
            return Err(QueueError::config(
                "exponential backoff needs a non-zero base; use a fixed policy for immediate retries",
            ));
        }
        if self.ceiling_factor < 1 {
            return Err(QueueError::config("backoff ceiling factor must be >= 1"));
        }
        if !(0.0..1.0).contains(&self.jitter_fraction) {
            return Err(QueueError::config(format!(
                "jitter fraction must be in [0, 1), got {}",
                self.jitter_fraction
            )));
        }
        Ok(())
    }

    /// Backoff before the attempt following failed attempt number `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match self.backoff_kind {
            BackoffKind::Fixed => self.backoff_base,
            BackoffKind::Exponential => {
                let ceiling = self.backoff_base.saturating_mul(self.ceiling_factor);
                let exponent = attempt.saturating_sub(1).min(31);
                self.backoff_base
                    .checked_mul(1u32 << exponent)
                    .map_or(ceiling, |delay| delay.min(ceiling))
            }
        }
    }

    /// Backoff including jitter: `base * (1 + uniform(-j, +j))`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_fraction <= 0.0 || base.is_zero() {
            return base;
        }
        let j = self.jitter_fraction;
        let factor = 1.0 + rand::thread_rng().gen_range(-j..j);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }
}
