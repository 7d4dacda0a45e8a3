//! Retry utilities: bounded exponential backoff.
//!
//! Uses `backon` for exponential backoff. A single `RetryPolicy` shape drives
//! both dispatcher reply polling and worker idle polling.

use std::time::Duration;

use backon::ExponentialBuilder;
use serde::Deserialize;

/// Bounded exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt.
    pub factor: f32,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    /// Randomize delays to spread out competing pollers.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        reply_backoff()
    }
}

impl RetryPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Build the `backon` backoff for this policy.
    ///
    /// `max_attempts` counts the first try, so the builder gets one fewer retry.
    pub fn builder(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.initial_delay())
            .with_factor(self.factor)
            .with_max_delay(self.max_delay())
            .with_max_times(self.max_attempts.saturating_sub(1));

        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Worst-case time spent sleeping before giving up.
    pub fn total_delay(&self) -> Duration {
        let mut delay = self.initial_delay().as_secs_f64();
        let cap = self.max_delay().as_secs_f64();
        let mut total = 0.0;
        for _ in 1..self.max_attempts {
            total += delay.min(cap);
            delay *= f64::from(self.factor);
        }
        Duration::from_secs_f64(total)
    }
}

/// Standard backoff for awaiting a keyed reply.
///
/// - Initial delay: 100ms
/// - Factor: 2
/// - Max delay: 1s
/// - Max attempts: 15
pub fn reply_backoff() -> RetryPolicy {
    RetryPolicy {
        initial_delay_ms: 100,
        factor: 2.0,
        max_delay_ms: 1_000,
        max_attempts: 15,
        jitter: false,
    }
}

/// Backoff for a worker whose queue and subscription are both empty.
///
/// - Initial delay: 10ms
/// - Factor: 2
/// - Max delay: 500ms
/// - Restarted after every processed message
pub fn idle_backoff() -> RetryPolicy {
    RetryPolicy {
        initial_delay_ms: 10,
        factor: 2.0,
        max_delay_ms: 500,
        max_attempts: 64,
        jitter: false,
    }
}
