//! Graceful shutdown for the realtime gateway.
//!
//! The coordinator:
//! 1. Flips the drain flag so new upgrades and handshakes are refused
//! 2. Tells every open connection to reconnect after `reconnectDelayMs`
//! 3. Waits the grace window, then closes every socket with a normal closure
//! 4. Signals background tasks and waits for sessions to finish cleanup

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::config::ShutdownConfig;
use crate::connection_manager::{CloseReason, ConnectionRegistry, ConnectionState};
use crate::websocket::ServerEvent;

const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Drain state shared with the upgrade handler and sessions.
pub struct ShutdownCoordinator {
    registry: Arc<ConnectionRegistry>,
    config: ShutdownConfig,
    draining: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        config: ShutdownConfig,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            registry,
            config,
            draining: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Receiver that fires once background tasks should stop.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn reconnect_delay_ms(&self) -> u64 {
        self.config.reconnect_delay_ms
    }

    /// Execute the shutdown sequence. Calling it twice is a no-op.
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.registry.len())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = Instant::now();
        let mut result = ShutdownResult::default();

        if self.draining.swap(true, Ordering::AcqRel) {
            tracing::debug!("Shutdown already in progress");
            return result;
        }

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Notifying clients");
        result.clients_notified = self.notify_clients();

        tracing::info!(grace_ms = self.config.grace_ms, "Phase 2: Grace window");
        tokio::time::sleep(self.config.grace()).await;

        tracing::info!("Phase 3: Closing connections");
        let initial = self.close_all();

        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 4: Waiting for sessions to finish cleanup");
        result.connections_closed = self.wait_for_connections_to_close(initial).await;

        result.duration = start.elapsed();
        result.success = self.registry.is_empty();

        tracing::info!(
            clients_notified = result.clients_notified,
            connections_closed = result.connections_closed,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    fn notify_clients(&self) -> usize {
        let connections = self.registry.all();
        if connections.is_empty() {
            return 0;
        }

        let event = ServerEvent::server_shutdown(self.config.reconnect_delay_ms);
        let mut notified = 0;
        for handle in &connections {
            if handle.state() == ConnectionState::Open {
                handle.set_state(ConnectionState::Draining);
            }
            match handle.emit(event.clone()) {
                Ok(()) => notified += 1,
                Err(e) => {
                    tracing::debug!(
                        connection_id = %handle.id,
                        error = %e,
                        "Failed to send shutdown notification"
                    );
                }
            }
        }

        tracing::info!(
            notified = notified,
            total = connections.len(),
            reconnect_delay_ms = self.config.reconnect_delay_ms,
            "Shutdown notifications sent"
        );
        notified
    }

    fn close_all(&self) -> usize {
        let connections = self.registry.all();
        for handle in &connections {
            handle.close(CloseReason::ServerShutdown);
        }
        connections.len()
    }

    async fn wait_for_connections_to_close(&self, initial: usize) -> usize {
        if initial == 0 {
            return 0;
        }

        let wait_future = async {
            while !self.registry.is_empty() {
                tokio::time::sleep(CLOSE_POLL_INTERVAL).await;
            }
        };
        let _ = timeout(self.config.close_timeout(), wait_future).await;

        let remaining = self.registry.len();
        if remaining > 0 {
            tracing::warn!(
                remaining_connections = remaining,
                "Some connections did not finish closing"
            );
        }
        initial.saturating_sub(remaining)
    }
}

/// Result of a graceful shutdown
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Every connection finished cleanup before the close timeout
    pub success: bool,
    pub clients_notified: usize,
    pub connections_closed: usize,
    pub duration: Duration,
}
