//! Backoff policy for contended operations (lock acquisition, CAS loops).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// How long to wait between attempts, and how many attempts to make.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 0 = unbounded (the caller's deadline decides).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction (0.0-1.0) of the delay used as +/- spread.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.2,
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far
    /// (1-indexed).
    ///
    /// The spread depends only on `attempt`, so every caller at the same
    /// attempt waits the same time. Use `delay_for_attempt_seeded` when
    /// contending callers should fall out of step.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.spread(attempt, ((attempt as f64 * 37.0) % 100.0) / 100.0)
    }

    /// Like `delay_for_attempt`, with the spread keyed on `seed` as well.
    pub fn delay_for_attempt_seeded(&self, attempt: u32, seed: &str) -> Duration {
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        attempt.hash(&mut hasher);
        self.spread(attempt, (hasher.finish() % 1000) as f64 / 1000.0)
    }

    /// `unit` in [0, 1) picks the offset within +/- the jitter fraction.
    fn spread(&self, attempt: u32, unit: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => (base_ms * 2_f64.powi((attempt - 1).min(30) as i32)).min(max_ms),
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        let spread = delay_ms * self.jitter.clamp(0.0, 1.0);
        let offset = spread * (unit - 0.5) * 2.0;

        Duration::from_millis((delay_ms + offset).max(0.0) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}
