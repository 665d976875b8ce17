use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::connection_manager::{CloseReason, ConnectionRegistry};
use crate::presence::PresenceAggregator;

/// Background task that keeps this node's presence entries alive and sweeps
/// connections whose session stopped reading.
///
/// Presence entries expire after the TTL unless refreshed, so a node that
/// dies without cleanup stops counting toward its devices' presence.
pub struct PresenceHeartbeatTask {
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceAggregator>,
    refresh_interval: Duration,
    /// Connections silent for longer than this are closed
    stale_after: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl PresenceHeartbeatTask {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceAggregator>,
        refresh_interval: Duration,
        stale_after: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            registry,
            presence,
            refresh_interval,
            stale_after,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.refresh_interval);
        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            refresh_interval_ms = self.refresh_interval.as_millis() as u64,
            stale_after_ms = self.stale_after.as_millis() as u64,
            presence_ttl_secs = self.presence.ttl().as_secs(),
            "Presence heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Presence heartbeat task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.refresh_presence().await;
                    self.sweep_stale_connections();
                }
            }
        }

        tracing::info!("Presence heartbeat task stopped");
    }

    async fn refresh_presence(&self) {
        let entries = self.registry.client_connections();
        if entries.is_empty() {
            return;
        }

        let start = Instant::now();
        self.presence.refresh(&entries).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        tracing::debug!(
            connections = entries.len(),
            elapsed_ms = elapsed_ms,
            "Refreshed presence entries"
        );

        if elapsed_ms > self.refresh_interval.as_millis() as u64 / 2 {
            tracing::warn!(
                elapsed_ms = elapsed_ms,
                refresh_interval_ms = self.refresh_interval.as_millis() as u64,
                connections = entries.len(),
                "Presence refresh took more than 50% of interval"
            );
        }
    }

    fn sweep_stale_connections(&self) {
        let Ok(stale_after) = chrono::Duration::from_std(self.stale_after) else {
            return;
        };
        let cutoff = chrono::Utc::now() - stale_after;

        let mut closed = 0;
        for handle in self.registry.find_stale(cutoff) {
            if handle.close(CloseReason::HeartbeatTimeout) {
                closed += 1;
            }
        }

        if closed > 0 {
            tracing::info!(
                closed = closed,
                stale_after_ms = self.stale_after.as_millis() as u64,
                "Closed stale connections"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryPolicy;
    use crate::connection_manager::{
        CloseSignal, ConnectionHandle, ConnectionIdentity, ConnectionState, OutboundQueue,
    };
    use crate::presence::MemoryPresenceStore;
    use crate::redis::RedisHealth;
    use uuid::Uuid;

    fn presence(ttl: Duration) -> Arc<PresenceAggregator> {
        Arc::new(PresenceAggregator::new(
            Arc::new(MemoryPresenceStore::new()),
            ttl,
            RetryPolicy::default(),
            Arc::new(RedisHealth::disabled()),
        ))
    }

    #[tokio::test]
    async fn test_heartbeat_task_shutdown() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = PresenceHeartbeatTask::new(
            registry,
            presence(Duration::from_secs(120)),
            Duration::from_millis(50),
            Duration::from_secs(60),
            shutdown_rx,
        );

        let handle = tokio::spawn(task.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("Task should complete")
            .expect("Task should not panic");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_live_device_online() {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = presence(Duration::from_secs(3));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let (queue, _rx) = OutboundQueue::channel(1024);
        let handle = Arc::new(ConnectionHandle::new(
            Uuid::new_v4(),
            ConnectionIdentity::device("t1", "d1"),
            queue,
            CloseSignal::new(),
        ));
        handle.set_state(ConnectionState::Open);
        registry.register(handle.clone()).unwrap();
        let device = handle.identity.device_key().unwrap();
        presence.connection_opened(&device, handle.id).await;

        let task = PresenceHeartbeatTask::new(
            registry,
            presence.clone(),
            Duration::from_secs(1),
            Duration::from_secs(3600),
            shutdown_rx,
        );
        tokio::spawn(task.run());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(presence.is_online(&device).await);
    }

    #[tokio::test]
    async fn test_sweep_closes_stale_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let (queue, _rx) = OutboundQueue::channel(1024);
        let handle = Arc::new(ConnectionHandle::new(
            Uuid::new_v4(),
            ConnectionIdentity::device("t1", "d1"),
            queue,
            CloseSignal::new(),
        ));
        handle.set_state(ConnectionState::Open);
        registry.register(handle.clone()).unwrap();

        let task = PresenceHeartbeatTask::new(
            registry,
            presence(Duration::from_secs(120)),
            Duration::from_secs(1),
            Duration::ZERO,
            shutdown_rx,
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        task.sweep_stale_connections();

        assert_eq!(
            handle.close_signal().reason(),
            Some(CloseReason::HeartbeatTimeout)
        );
    }
}
