//! Per-connection outbound queue with a byte budget.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::types::CloseReason;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboundError {
    #[error("Outbound queue over limit ({queued}/{limit} bytes)")]
    Backpressure { queued: usize, limit: usize },

    #[error("Connection closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close(CloseReason),
}

#[derive(Debug)]
struct QueueShared {
    queued: AtomicUsize,
    limit: usize,
    discard: AtomicBool,
}

/// Sending half held by the connection handle.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    shared: Arc<QueueShared>,
}

/// Receiving half owned by the writer task.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<OutboundFrame>,
    shared: Arc<QueueShared>,
}

impl OutboundQueue {
    pub fn channel(limit: usize) -> (OutboundQueue, OutboundReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(QueueShared {
            queued: AtomicUsize::new(0),
            limit,
            discard: AtomicBool::new(false),
        });
        (
            OutboundQueue {
                tx,
                shared: shared.clone(),
            },
            OutboundReceiver { rx, shared },
        )
    }

    /// Enqueue a text frame without waiting.
    ///
    /// Fails with `Backpressure` once queued-but-unwritten bytes would exceed
    /// the limit; the frame is not enqueued in that case.
    pub fn push(&self, text: String) -> Result<(), OutboundError> {
        let len = text.len();
        let previous = self.shared.queued.fetch_add(len, Ordering::AcqRel);
        let queued = previous + len;
        if queued > self.shared.limit {
            self.shared.queued.fetch_sub(len, Ordering::AcqRel);
            return Err(OutboundError::Backpressure {
                queued,
                limit: self.shared.limit,
            });
        }
        if self.tx.send(OutboundFrame::Text(text)).is_err() {
            self.shared.queued.fetch_sub(len, Ordering::AcqRel);
            return Err(OutboundError::Closed);
        }
        Ok(())
    }

    /// Enqueue a close frame. Never subject to the byte limit.
    pub fn push_close(&self, reason: CloseReason) -> Result<(), OutboundError> {
        if reason.discards_pending() {
            self.shared.discard.store(true, Ordering::Release);
        }
        self.tx
            .send(OutboundFrame::Close(reason))
            .map_err(|_| OutboundError::Closed)
    }

    pub fn queued_bytes(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.shared.limit
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl OutboundReceiver {
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.rx.recv().await
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.rx.try_recv().ok()
    }

    /// Return the budget for a frame that left the queue.
    pub fn release(&self, len: usize) {
        self.shared.queued.fetch_sub(len, Ordering::AcqRel);
    }

    /// Whether pending text frames should be dropped rather than written.
    pub fn discarding(&self) -> bool {
        self.shared.discard.load(Ordering::Acquire)
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_and_release_tracks_bytes() {
        let (queue, mut rx) = OutboundQueue::channel(100);
        queue.push("hello".to_string()).unwrap();
        queue.push("world!".to_string()).unwrap();
        assert_eq!(queue.queued_bytes(), 11);

        match rx.recv().await.unwrap() {
            OutboundFrame::Text(text) => rx.release(text.len()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(queue.queued_bytes(), 6);
    }

    #[test]
    fn test_push_over_limit_is_rejected_without_enqueue() {
        let (queue, _rx) = OutboundQueue::channel(10);
        queue.push("12345678".to_string()).unwrap();

        let err = queue.push("abc".to_string()).unwrap_err();
        assert_eq!(err, OutboundError::Backpressure { queued: 11, limit: 10 });
        assert_eq!(queue.queued_bytes(), 8);
    }

    #[tokio::test]
    async fn test_close_bypasses_limit_and_sets_discard() {
        let (queue, mut rx) = OutboundQueue::channel(1);
        queue.push_close(CloseReason::Backpressure).unwrap();

        assert!(rx.discarding());
        assert_eq!(
            rx.recv().await,
            Some(OutboundFrame::Close(CloseReason::Backpressure))
        );
    }

    #[test]
    fn test_graceful_close_keeps_pending_frames() {
        let (queue, rx) = OutboundQueue::channel(100);
        queue.push_close(CloseReason::ServerShutdown).unwrap();
        assert!(!rx.discarding());
    }

    #[test]
    fn test_push_after_receiver_dropped() {
        let (queue, rx) = OutboundQueue::channel(100);
        drop(rx);
        assert_eq!(queue.push("x".to_string()), Err(OutboundError::Closed));
        assert_eq!(queue.queued_bytes(), 0);
    }
}
