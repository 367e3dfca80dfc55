//! Exponential backoff retry policy with jitter.

use std::time::Duration;

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum total attempts (first try included).
    pub max_attempts: u32,
    /// Initial backoff delay.
    pub initial_backoff: Duration,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff: Duration,
    /// Multiplier applied to the backoff on each retry.
    pub multiplier: f64,
    /// Add up to `jitter_fraction * backoff` of jitter (0.0 = none).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: 0.25,
        }
    }
}

/// Stateless retry policy — computes the next delay for an attempt number.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The delay before retrying after `failures` failed attempts, or
    /// `None` when the attempt budget is spent.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        if failures >= self.config.max_attempts {
            return None;
        }
        let base_ms = self.config.initial_backoff.as_millis() as f64
            * self.config.multiplier.powi(failures.saturating_sub(1) as i32);
        let capped = base_ms.min(self.config.max_backoff.as_millis() as f64);

        // Decorrelated-ish jitter without a PRNG: spread attempts of
        // concurrent tasks by the sub-millisecond clock phase.
        let phase = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| (d.subsec_micros() % 1000) as f64 / 1000.0)
            .unwrap_or(0.5);
        let jitter_ms = capped * self.config.jitter_fraction * phase;

        Some(Duration::from_millis((capped + jitter_ms) as u64))
    }
}
