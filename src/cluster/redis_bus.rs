//! Redis pub/sub bus.
//!
//! Publishing goes through the shared pool. Receiving uses one dedicated
//! pub/sub connection with a single `PSUBSCRIBE {prefix}:*`; incoming messages
//! are dispatched to the local handler table, so per-tenant subscribe and
//! unsubscribe never touch Redis.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast;

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::metrics::RedisMetrics;
use crate::redis::RedisPool;

use super::bus::{Bus, BusError, BusHandler, HandlerTable, SubscriptionId};

pub struct RedisBus {
    pool: Arc<RedisPool>,
    handlers: HandlerTable,
    prefix: String,
    backoff: BackoffConfig,
}

impl RedisBus {
    pub fn new(pool: Arc<RedisPool>, prefix: impl Into<String>, backoff: BackoffConfig) -> Self {
        Self {
            pool,
            handlers: HandlerTable::new(),
            prefix: prefix.into(),
            backoff,
        }
    }

    fn pattern(&self) -> String {
        format!("{}:*", self.prefix)
    }

    /// Run the subscriber until shutdown, reconnecting with backoff.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = ExponentialBackoff::with_config(self.backoff.clone());
        let pattern = self.pattern();

        tracing::info!(pattern = %pattern, "Starting bus subscriber");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Bus subscriber stopped");
                    return;
                }
                result = self.subscription_loop(&pattern, &mut backoff) => {
                    if let Err(e) = result {
                        self.pool.health().set_reconnecting();
                        RedisMetrics::set_connected(false);
                        let delay = backoff.next_delay();
                        tracing::error!(
                            error = %e,
                            attempt = backoff.attempt(),
                            retry_in_ms = delay.as_millis() as u64,
                            "Bus subscription lost, reconnecting"
                        );
                        tokio::select! {
                            _ = shutdown.recv() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    async fn subscription_loop(
        &self,
        pattern: &str,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), BusError> {
        let mut pubsub = self.pool.pubsub().await?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| BusError::Store(e.into()))?;

        tracing::info!(pattern = %pattern, "Bus subscription established");
        backoff.reset();

        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            let channel = msg.get_channel_name().to_string();
            let payload = Bytes::copy_from_slice(msg.get_payload_bytes());
            self.handlers.dispatch(&channel, payload);
        }

        Err(BusError::Unavailable("pub/sub stream ended".to_string()))
    }
}

#[async_trait]
impl Bus for RedisBus {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        let channel = channel.to_string();
        let _receivers: i64 = self
            .pool
            .execute(|mut conn| async move {
                redis::cmd("PUBLISH")
                    .arg(&channel)
                    .arg(&payload[..])
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(())
    }

    fn subscribe(&self, channel: &str, handler: BusHandler) -> SubscriptionId {
        self.handlers.add(channel, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.handlers.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use crate::redis::{CircuitBreaker, RedisHealth};

    #[test]
    fn test_pattern_covers_prefix() {
        let config = RedisConfig::default();
        let pool = RedisPool::new(
            &config,
            Arc::new(CircuitBreaker::new()),
            Arc::new(RedisHealth::new()),
        )
        .unwrap();
        let bus = RedisBus::new(Arc::new(pool), "ara:rt", BackoffConfig::default());
        assert_eq!(bus.pattern(), "ara:rt:*");
        assert_eq!(bus.backend_name(), "redis");
    }
}
