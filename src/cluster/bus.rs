//! Publish/subscribe bus between gateway nodes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::redis::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Bus store error: {0}")]
    Store(#[from] PoolError),

    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Called with `(channel, payload)` for every message on a subscribed channel.
///
/// Handlers run on the bus dispatch path and must not block.
pub type BusHandler = Arc<dyn Fn(&str, Bytes) + Send + Sync>;

#[async_trait]
pub trait Bus: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError>;

    fn subscribe(&self, channel: &str, handler: BusHandler) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}

/// Channel -> handlers table shared by bus implementations.
#[derive(Default)]
pub struct HandlerTable {
    next_id: AtomicU64,
    channels: DashMap<String, Vec<(SubscriptionId, BusHandler)>>,
    owners: DashMap<SubscriptionId, String>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, channel: &str, handler: BusHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push((id, handler));
        self.owners.insert(id, channel.to_string());
        tracing::debug!(channel = %channel, subscription = id.0, "Bus subscription added");
        id
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        let Some((_, channel)) = self.owners.remove(&id) else {
            return false;
        };
        if let Some(mut handlers) = self.channels.get_mut(&channel) {
            handlers.retain(|(sub, _)| *sub != id);
            if handlers.is_empty() {
                drop(handlers);
                self.channels.remove_if(&channel, |_, h| h.is_empty());
            }
        }
        tracing::debug!(channel = %channel, subscription = id.0, "Bus subscription removed");
        true
    }

    /// Call every handler registered for `channel`. Returns how many ran.
    pub fn dispatch(&self, channel: &str, payload: Bytes) -> usize {
        // Clone out so handlers may (un)subscribe without deadlocking the map
        let handlers: Vec<BusHandler> = match self.channels.get(channel) {
            Some(entry) => entry.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };
        for handler in &handlers {
            handler(channel, payload.clone());
        }
        handlers.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }
}
