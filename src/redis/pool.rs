//! Shared Redis connection for presence and bus publishing.

use std::future::Future;
use std::sync::Arc;

use redis::aio::{MultiplexedConnection, PubSub};
use redis::{Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::config::RedisConfig;

use super::{CircuitBreaker, CircuitBreakerStats, CircuitState, RedisHealth};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Circuit breaker is open")]
    CircuitOpen,
}

/// Multiplexed Redis connection shared by every task on the node.
///
/// Calls go through [`RedisPool::execute`], which gates on the circuit breaker
/// and drops the cached connection when Redis reports an I/O failure so the
/// next call reconnects.
pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    circuit_breaker: Arc<CircuitBreaker>,
    health: Arc<RedisHealth>,
    url: String,
}

impl RedisPool {
    pub fn new(
        config: &RedisConfig,
        circuit_breaker: Arc<CircuitBreaker>,
        health: Arc<RedisHealth>,
    ) -> Result<Self, PoolError> {
        let client = Client::open(config.url.as_str())?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            circuit_breaker,
            health,
            url: config.url.clone(),
        })
    }

    pub async fn get_connection(&self) -> Result<MultiplexedConnection, PoolError> {
        if !self.circuit_breaker.allow_request() {
            self.health.set_circuit_open();
            return Err(PoolError::CircuitOpen);
        }

        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }

        self.connect().await
    }

    async fn connect(&self) -> Result<MultiplexedConnection, PoolError> {
        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        self.health.set_reconnecting();
        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *guard = Some(conn.clone());
                self.circuit_breaker.record_success();
                self.health.set_connected();
                tracing::info!(url = %self.url, "Redis connection established");
                Ok(conn)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Run one command (or pipeline/script) on the shared connection.
    pub async fn execute<F, T, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(value) => {
                self.circuit_breaker.record_success();
                Ok(value)
            }
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    *self.connection.write().await = None;
                    self.health.set_reconnecting();
                }
                self.circuit_breaker.record_failure();
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Dedicated pub/sub connection; subscriptions cannot share the multiplexed one.
    pub async fn pubsub(&self) -> Result<PubSub, PoolError> {
        Ok(self.client.get_async_pubsub().await?)
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy() && self.circuit_breaker.state() == CircuitState::Closed
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    pub fn circuit_stats(&self) -> CircuitBreakerStats {
        self.circuit_breaker.stats()
    }

    pub fn health(&self) -> &Arc<RedisHealth> {
        &self.health
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn ping(&self) -> Result<(), PoolError> {
        self.execute(|mut conn| async move {
            let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::CircuitBreakerConfig;

    #[test]
    fn test_pool_creation_does_not_connect() {
        let pool = RedisPool::new(
            &RedisConfig::default(),
            Arc::new(CircuitBreaker::new()),
            Arc::new(RedisHealth::new()),
        )
        .unwrap();
        assert_eq!(pool.url(), "redis://localhost:6379");
        assert_eq!(pool.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits_calls() {
        let cb = Arc::new(CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            reset_timeout_ms: 60_000,
        }));
        let health = Arc::new(RedisHealth::new());
        let pool = RedisPool::new(&RedisConfig::default(), cb.clone(), health.clone()).unwrap();

        cb.record_failure();
        let err = pool.get_connection().await.unwrap_err();
        assert!(matches!(err, PoolError::CircuitOpen));
        assert_eq!(health.status(), crate::redis::RedisHealthStatus::CircuitOpen);
        assert!(!pool.is_healthy());
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let config = RedisConfig {
            url: "not-a-url".to_string(),
            ..RedisConfig::default()
        };
        let result = RedisPool::new(
            &config,
            Arc::new(CircuitBreaker::new()),
            Arc::new(RedisHealth::new()),
        );
        assert!(result.is_err());
    }
}
