//! Acknowledgement correlation.
//!
//! Each emit that wants a reply allocates the next ack id and parks a oneshot
//! sender here. The id is retired exactly once: by the matching ACK, by its
//! deadline, by `fail_all` when the connection goes away, or by dropping the
//! waiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::metrics::AckMetrics;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AckError {
    #[error("Ack {ack_id} timed out after {timeout_ms}ms")]
    Timeout { ack_id: u64, timeout_ms: u64 },

    #[error("Ack wait cancelled")]
    Cancelled,

    #[error("Connection closed before ack")]
    ConnectionClosed,

    #[error("Failed to send: {0}")]
    Send(String),
}

type AckResult = Result<Vec<Value>, AckError>;

struct PendingAck {
    sent_at: Instant,
    tx: oneshot::Sender<AckResult>,
}

struct AckRegistryInner {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingAck>,
}

/// Pending acks for one connection.
#[derive(Clone)]
pub struct AckRegistry {
    inner: Arc<AckRegistryInner>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AckRegistryInner {
                next_id: AtomicU64::new(0),
                pending: DashMap::new(),
            }),
        }
    }

    /// Allocate an ack id and start its deadline.
    pub fn register(&self, timeout: Duration) -> AckWaiter {
        let ack_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        self.inner.pending.insert(ack_id, PendingAck { sent_at: now, tx });

        AckWaiter {
            ack_id,
            deadline: now + timeout,
            timeout,
            rx,
            registry: self.clone(),
        }
    }

    /// Complete a pending ack. Returns `false` for unknown or already retired ids.
    pub fn resolve(&self, ack_id: u64, args: Vec<Value>) -> bool {
        match self.inner.pending.remove(&ack_id) {
            Some((_, pending)) => {
                AckMetrics::record_resolved(pending.sent_at.elapsed());
                let _ = pending.tx.send(Ok(args));
                true
            }
            None => false,
        }
    }

    /// Drop a registration whose emit never left the node.
    pub fn forget(&self, ack_id: u64) {
        self.inner.pending.remove(&ack_id);
    }

    /// Fail every pending ack, returning how many were failed.
    pub fn fail_all(&self, error: AckError) -> usize {
        let ids: Vec<u64> = self.inner.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.inner.pending.remove(&id) {
                let _ = pending.tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        if failed > 0 {
            AckMetrics::record_cancelled(failed);
        }
        failed
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }
}

impl Default for AckRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Future side of a registered ack.
pub struct AckWaiter {
    ack_id: u64,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<AckResult>,
    registry: AckRegistry,
}

impl AckWaiter {
    pub fn ack_id(&self) -> u64 {
        self.ack_id
    }

    pub async fn wait(mut self) -> AckResult {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AckError::ConnectionClosed),
            Err(_) => {
                if self.registry.inner.pending.remove(&self.ack_id).is_some() {
                    AckMetrics::record_timeout();
                    return Err(AckError::Timeout {
                        ack_id: self.ack_id,
                        timeout_ms: self.timeout.as_millis() as u64,
                    });
                }
                // Resolved concurrently with the deadline; the sender already fired.
                match (&mut self.rx).await {
                    Ok(result) => result,
                    Err(_) => Err(AckError::ConnectionClosed),
                }
            }
        }
    }
}

impl Drop for AckWaiter {
    fn drop(&mut self) {
        self.registry.inner.pending.remove(&self.ack_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let registry = AckRegistry::new();
        let a = registry.register(Duration::from_secs(1));
        let b = registry.register(Duration::from_secs(1));
        assert!(b.ack_id() > a.ack_id());
        assert_eq!(registry.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_resolves_by_id_regardless_of_order() {
        let registry = AckRegistry::new();
        let first = registry.register(Duration::from_secs(5));
        let second = registry.register(Duration::from_secs(5));

        assert!(registry.resolve(second.ack_id(), vec![json!("two")]));
        assert!(registry.resolve(first.ack_id(), vec![json!("one")]));

        assert_eq!(first.wait().await.unwrap(), vec![json!("one")]);
        assert_eq!(second.wait().await.unwrap(), vec![json!("two")]);
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_ids() {
        let registry = AckRegistry::new();
        let waiter = registry.register(Duration::from_secs(5));
        let id = waiter.ack_id();

        assert!(!registry.resolve(999, vec![]));
        assert!(registry.resolve(id, vec![]));
        assert!(!registry.resolve(id, vec![]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retires_id() {
        let registry = AckRegistry::new();
        let waiter = registry.register(Duration::from_millis(10_000));
        let id = waiter.ack_id();

        let result = waiter.wait().await;
        assert_eq!(
            result,
            Err(AckError::Timeout {
                ack_id: id,
                timeout_ms: 10_000
            })
        );
        assert_eq!(registry.pending_count(), 0);
        assert!(!registry.resolve(id, vec![]));
    }

    #[tokio::test]
    async fn test_fail_all_cancels_waiters() {
        let registry = AckRegistry::new();
        let a = registry.register(Duration::from_secs(5));
        let b = registry.register(Duration::from_secs(5));

        assert_eq!(registry.fail_all(AckError::Cancelled), 2);
        assert_eq!(a.wait().await, Err(AckError::Cancelled));
        assert_eq!(b.wait().await, Err(AckError::Cancelled));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_retires_id() {
        let registry = AckRegistry::new();
        let waiter = registry.register(Duration::from_millis(100));
        let id = waiter.ack_id();

        let abandoned = tokio::time::timeout(Duration::from_millis(10), waiter.wait()).await;
        assert!(abandoned.is_err());
        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(registry.pending_count(), 0);
        assert!(!registry.resolve(id, vec![]));
    }

    #[tokio::test]
    async fn test_dropping_unawaited_waiter_retires_id() {
        let registry = AckRegistry::new();
        let kept = registry.register(Duration::from_secs(5));
        drop(registry.register(Duration::from_secs(5)));

        assert_eq!(registry.pending_count(), 1);
        assert!(registry.resolve(kept.ack_id(), vec![]));
    }
}
