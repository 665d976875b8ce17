//! Shared-store connection health tracking

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use serde::Serialize;

use super::current_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedisHealthStatus {
    Healthy,
    Reconnecting,
    CircuitOpen,
    /// No shared store configured; the node runs on in-memory backends.
    Disabled,
}

impl RedisHealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedisHealthStatus::Healthy => "healthy",
            RedisHealthStatus::Reconnecting => "reconnecting",
            RedisHealthStatus::CircuitOpen => "circuit_open",
            RedisHealthStatus::Disabled => "disabled",
        }
    }

    fn from_raw(value: u8) -> Self {
        match value {
            0 => RedisHealthStatus::Healthy,
            2 => RedisHealthStatus::CircuitOpen,
            3 => RedisHealthStatus::Disabled,
            _ => RedisHealthStatus::Reconnecting,
        }
    }
}

/// Health of the shared store as seen by this node.
///
/// Besides connection state it counts how often presence or fan-out fell back
/// to node-local operation, which is what `/health` reports as `degraded`.
pub struct RedisHealth {
    status: AtomicU8,
    last_connected: AtomicI64,
    reconnection_attempts: AtomicU32,
    total_reconnections: AtomicU32,
    degradations: AtomicU64,
}

impl RedisHealth {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(RedisHealthStatus::Reconnecting as u8),
            last_connected: AtomicI64::new(0),
            reconnection_attempts: AtomicU32::new(0),
            total_reconnections: AtomicU32::new(0),
            degradations: AtomicU64::new(0),
        }
    }

    /// Tracker for a node running without a shared store.
    pub fn disabled() -> Self {
        let health = Self::new();
        health
            .status
            .store(RedisHealthStatus::Disabled as u8, Ordering::Release);
        health
    }

    pub fn set_connected(&self) {
        let previous = self
            .status
            .swap(RedisHealthStatus::Healthy as u8, Ordering::AcqRel);
        self.last_connected.store(current_time_ms(), Ordering::Release);
        if previous != RedisHealthStatus::Healthy as u8 && self.had_reconnect_attempts() {
            self.total_reconnections.fetch_add(1, Ordering::AcqRel);
        }
        self.reconnection_attempts.store(0, Ordering::Release);
    }

    pub fn set_reconnecting(&self) {
        self.status
            .store(RedisHealthStatus::Reconnecting as u8, Ordering::Release);
        self.reconnection_attempts.fetch_add(1, Ordering::AcqRel);
    }

    pub fn set_circuit_open(&self) {
        self.status
            .store(RedisHealthStatus::CircuitOpen as u8, Ordering::Release);
    }

    /// Count one fallback to node-local operation.
    pub fn record_degradation(&self) {
        self.degradations.fetch_add(1, Ordering::AcqRel);
    }

    pub fn status(&self) -> RedisHealthStatus {
        RedisHealthStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    pub fn is_healthy(&self) -> bool {
        matches!(
            self.status(),
            RedisHealthStatus::Healthy | RedisHealthStatus::Disabled
        )
    }

    fn had_reconnect_attempts(&self) -> bool {
        self.reconnection_attempts.load(Ordering::Acquire) > 0
    }

    pub fn stats(&self) -> RedisHealthStats {
        RedisHealthStats {
            status: self.status(),
            last_connected_ms: self.last_connected.load(Ordering::Acquire),
            reconnection_attempts: self.reconnection_attempts.load(Ordering::Acquire),
            total_reconnections: self.total_reconnections.load(Ordering::Acquire),
            degradations: self.degradations.load(Ordering::Acquire),
        }
    }
}

impl Default for RedisHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RedisHealthStats {
    pub status: RedisHealthStatus,
    pub last_connected_ms: i64,
    pub reconnection_attempts: u32,
    pub total_reconnections: u32,
    pub degradations: u64,
}
