//! In-process bus.
//!
//! Delivers synchronously to every subscriber in the process. A single
//! `MemoryBus` shared by several routers behaves like a cluster of nodes on
//! one shared channel space.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use super::bus::{Bus, BusError, BusHandler, HandlerTable, SubscriptionId};

pub struct MemoryBus {
    handlers: HandlerTable,
    available: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            handlers: HandlerTable::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage; publishes fail while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn channel_count(&self) -> usize {
        self.handlers.channel_count()
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.handlers.has_channel(channel)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        if !self.available.load(Ordering::Acquire) {
            return Err(BusError::Unavailable("memory bus disabled".to_string()));
        }
        self.handlers.dispatch(channel, payload);
        Ok(())
    }

    fn subscribe(&self, channel: &str, handler: BusHandler) -> SubscriptionId {
        self.handlers.add(channel, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.handlers.remove(id);
    }
}
