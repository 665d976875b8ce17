//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use crate::redis::CircuitState;

use super::{
    ACKS_TOTAL, ACK_LATENCY, BUS_DROPPED_TOTAL, BUS_PUBLISHED_TOTAL, BUS_RECEIVED_TOTAL,
    CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED_TOTAL, EVENTS_RECEIVED_TOTAL, FANOUT_DELIVERIES_TOTAL,
    HANDSHAKES_TOTAL, PRESENCE_TRANSITIONS_TOTAL, PROTOCOL_VIOLATIONS_TOTAL,
    REDIS_CIRCUIT_BREAKER_STATE, REDIS_CONNECTION_STATUS, ROOMS_ACTIVE, STORE_DEGRADATIONS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Events we label individually; anything else is counted as `other`.
const KNOWN_EVENTS: &[&str] = &["join", "leave", "typing"];

/// Socket lifecycle and protocol metrics
pub struct TransportMetrics;

impl TransportMetrics {
    pub fn connection_opened(namespace: &str) {
        CONNECTIONS_ACTIVE.with_label_values(&[namespace]).inc();
    }

    pub fn connection_closed(namespace: &str, reason: &str) {
        CONNECTIONS_ACTIVE.with_label_values(&[namespace]).dec();
        CONNECTIONS_CLOSED_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Connections closed before they finished the handshake
    pub fn handshake_closed(reason: &str) {
        CONNECTIONS_CLOSED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn record_handshake(outcome: &str) {
        HANDSHAKES_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn record_violation(kind: &str) {
        PROTOCOL_VIOLATIONS_TOTAL.with_label_values(&[kind]).inc();
    }

    pub fn record_event(name: &str) {
        let label = if KNOWN_EVENTS.contains(&name) { name } else { "other" };
        EVENTS_RECEIVED_TOTAL.with_label_values(&[label]).inc();
    }
}

/// Acknowledgement metrics
pub struct AckMetrics;

impl AckMetrics {
    pub fn record_resolved(latency: Duration) {
        ACKS_TOTAL.with_label_values(&["resolved"]).inc();
        ACK_LATENCY.observe(latency.as_secs_f64());
    }

    pub fn record_timeout() {
        ACKS_TOTAL.with_label_values(&["timeout"]).inc();
    }

    pub fn record_cancelled(count: usize) {
        ACKS_TOTAL
            .with_label_values(&["cancelled"])
            .inc_by(count as u64);
    }
}

/// Presence and room fan-out metrics
pub struct PresenceMetrics;

impl PresenceMetrics {
    pub fn record_transition(online: bool) {
        let label = if online { "online" } else { "offline" };
        PRESENCE_TRANSITIONS_TOTAL.with_label_values(&[label]).inc();
    }

    pub fn record_degraded() {
        STORE_DEGRADATIONS_TOTAL.with_label_values(&["presence"]).inc();
    }

    pub fn set_rooms_active(count: usize) {
        ROOMS_ACTIVE.set(count as i64);
    }

    pub fn record_deliveries(count: usize) {
        FANOUT_DELIVERIES_TOTAL.inc_by(count as u64);
    }
}

/// Cross-node bus metrics
pub struct BusMetrics;

impl BusMetrics {
    pub fn record_published() {
        BUS_PUBLISHED_TOTAL.inc();
    }

    pub fn record_received() {
        BUS_RECEIVED_TOTAL.inc();
    }

    pub fn record_dropped(reason: &str) {
        BUS_DROPPED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn record_degraded() {
        STORE_DEGRADATIONS_TOTAL.with_label_values(&["bus"]).inc();
    }
}

/// Shared-store connection metrics
pub struct RedisMetrics;

impl RedisMetrics {
    pub fn set_connected(connected: bool) {
        REDIS_CONNECTION_STATUS.set(if connected { 1 } else { 0 });
    }

    pub fn set_circuit_state(state: CircuitState) {
        REDIS_CIRCUIT_BREAKER_STATE.set(state as i64);
    }
}
