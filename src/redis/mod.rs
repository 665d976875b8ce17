//! Shared-store plumbing.
//!
//! - `RedisPool`: multiplexed connection behind a circuit breaker
//! - `CircuitBreaker`: stops hammering Redis while it is down
//! - `RedisHealth`: connection status and degradation counter for `/health`
//!
//! Presence and the cross-node bus both run on top of the pool.

mod circuit_breaker;
mod health;
pub mod pool;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use health::{RedisHealth, RedisHealthStats, RedisHealthStatus};
pub use pool::{PoolError, RedisPool};

/// Current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
