//! Exponential backoff and bounded retry.
//!
//! Shared by the Redis bus reconnect loop, the shared-store retry path and the
//! client reconnection controller.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential growth
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0), applied symmetrically around the base delay
    pub jitter_factor: f64,
}

impl BackoffConfig {
    /// Client reconnect schedule: 1s doubling to a 30s cap, ±10% jitter.
    pub fn reconnect() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Same schedule with jitter disabled.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000, // 30 seconds
            multiplier: 2.0,
            jitter_factor: 0.1, // 10% jitter
        }
    }
}

/// Exponential backoff calculator with jitter.
///
/// The delay for attempt `n` is `initial * multiplier^(n-1)`, capped at the
/// maximum. Jitter is applied to that base value only, so it never compounds
/// across attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with default configuration
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    /// Create a new exponential backoff with custom configuration
    pub fn with_config(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Un-jittered delay for a 1-based attempt number.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = raw.min(self.config.max_delay_ms as f64).max(1.0);
        Duration::from_millis(capped as u64)
    }

    /// Get the next delay duration
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let base = self.base_delay(self.attempt).as_millis() as f64;

        let final_delay = if self.config.jitter_factor > 0.0 {
            let jitter_range = base * self.config.jitter_factor;
            let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
            (base + jitter).max(1.0)
        } else {
            base
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Reset the backoff to initial state
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Get the current attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Add `U(0, ratio)` of extra delay on top of an advertised minimum.
pub fn jitter_above(minimum: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 || minimum.is_zero() {
        return minimum;
    }
    let extra_ms = minimum.as_millis() as f64 * ratio;
    let extra = rand::rng().random_range(0.0..=extra_ms);
    minimum + Duration::from_millis(extra as u64)
}

/// Bounded retry policy for shared-store operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig {
                initial_delay_ms: 50,
                max_delay_ms: 500,
                multiplier: 2.0,
                jitter_factor: 0.1,
            },
        }
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is reached.
///
/// The last error is returned when every attempt fails.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut backoff = ExponentialBackoff::with_config(policy.backoff.clone());
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    operation = %operation,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Shared store operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
