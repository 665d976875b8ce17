//! Circuit breaker guarding shared-store calls.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

use crate::config::RedisConfig;
use crate::metrics::RedisMetrics;

use super::current_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_raw(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Successes in half-open needed to close it again
    pub success_threshold: u32,
    /// How long the circuit stays open before a probe is allowed (ms)
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 30_000,
        }
    }
}

impl From<&RedisConfig> for CircuitBreakerConfig {
    fn from(config: &RedisConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_failure_threshold,
            success_threshold: config.circuit_breaker_success_threshold,
            reset_timeout_ms: config.circuit_breaker_reset_timeout_seconds * 1000,
        }
    }
}

/// Lock-free breaker: Closed → Open after N failures, Open → HalfOpen after the
/// reset timeout, HalfOpen → Closed after M successes or back to Open on any failure.
pub struct CircuitBreaker {
    state: AtomicU8,
    failures: AtomicU32,
    successes: AtomicU32,
    changed_at_ms: AtomicI64,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            changed_at_ms: AtomicI64::new(current_time_ms()),
            config,
        }
    }

    /// Current state, promoting Open to HalfOpen once the reset timeout elapsed.
    pub fn state(&self) -> CircuitState {
        let raw = CircuitState::from_raw(self.state.load(Ordering::Acquire));
        if raw != CircuitState::Open {
            return raw;
        }

        let elapsed = current_time_ms() - self.changed_at_ms.load(Ordering::Acquire);
        if elapsed < self.config.reset_timeout_ms as i64 {
            return CircuitState::Open;
        }

        let promoted = self
            .state
            .compare_exchange(
                CircuitState::Open as u8,
                CircuitState::HalfOpen as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if promoted {
            self.successes.store(0, Ordering::Release);
            self.changed_at_ms.store(current_time_ms(), Ordering::Release);
            RedisMetrics::set_circuit_state(CircuitState::HalfOpen);
            tracing::info!("Shared store circuit half-open, probing");
        }
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        match CircuitState::from_raw(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => self.failures.store(0, Ordering::Release),
            CircuitState::HalfOpen => {
                let successes = self.successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.set_state(CircuitState::Closed);
                    tracing::info!("Shared store circuit closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match CircuitState::from_raw(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.set_state(CircuitState::Open);
                    tracing::warn!(failures = failures, "Shared store circuit opened");
                }
            }
            CircuitState::HalfOpen => {
                self.set_state(CircuitState::Open);
                tracing::warn!("Shared store probe failed, circuit reopened");
            }
            CircuitState::Open => {
                self.changed_at_ms.store(current_time_ms(), Ordering::Release);
            }
        }
    }

    fn set_state(&self, state: CircuitState) {
        self.state.store(state as u8, Ordering::Release);
        self.changed_at_ms.store(current_time_ms(), Ordering::Release);
        self.successes.store(0, Ordering::Release);
        if state == CircuitState::Closed {
            self.failures.store(0, Ordering::Release);
        }
        RedisMetrics::set_circuit_state(state);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            failure_count: self.failures.load(Ordering::Acquire),
            success_count: self.successes.load(Ordering::Acquire),
            last_state_change_ms: self.changed_at_ms.load(Ordering::Acquire),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_state_change_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(failures: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: 2,
            reset_timeout_ms: reset_ms,
        })
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        assert!(cb.allow_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_then_close() {
        let cb = breaker(1, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(
            CircuitState::from_raw(cb.state.load(Ordering::Acquire)),
            CircuitState::Open
        );
    }

    #[test]
    fn test_config_from_redis_settings() {
        let config = CircuitBreakerConfig::from(&RedisConfig::default());
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout_ms, 30_000);
    }
}
