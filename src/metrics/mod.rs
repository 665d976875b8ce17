//! Prometheus metrics for the realtime gateway.
//!
//! - Connection metrics (active sockets, handshakes, closes by reason)
//! - Protocol metrics (violations, inbound events)
//! - ACK metrics (outcomes, latency)
//! - Presence and fan-out metrics (transitions, bus traffic, degradations)
//! - Shared-store health

mod helpers;

pub use helpers::{
    encode_metrics, AckMetrics, BusMetrics, PresenceMetrics, RedisMetrics, TransportMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_rt";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Open realtime connections by namespace
    pub static ref CONNECTIONS_ACTIVE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Number of open realtime connections",
        &["namespace"]
    ).unwrap();

    /// Handshake attempts by outcome
    pub static ref HANDSHAKES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_handshakes_total", METRIC_PREFIX),
        "Handshake attempts by outcome",
        &["outcome"]
    ).unwrap();

    /// Closed connections by close reason
    pub static ref CONNECTIONS_CLOSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_connections_closed_total", METRIC_PREFIX),
        "Closed connections by reason",
        &["reason"]
    ).unwrap();

    // ============================================================================
    // Protocol Metrics
    // ============================================================================

    /// Malformed frames dropped, by error kind
    pub static ref PROTOCOL_VIOLATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_protocol_violations_total", METRIC_PREFIX),
        "Malformed frames dropped",
        &["kind"]
    ).unwrap();

    /// Inbound client events by name
    pub static ref EVENTS_RECEIVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_received_total", METRIC_PREFIX),
        "Inbound events by name",
        &["event"]
    ).unwrap();

    // ============================================================================
    // ACK Metrics
    // ============================================================================

    /// ACK waits by outcome (resolved, timeout, cancelled)
    pub static ref ACKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_acks_total", METRIC_PREFIX),
        "Acknowledgement waits by outcome",
        &["outcome"]
    ).unwrap();

    /// Round trip from emit to matching ACK
    pub static ref ACK_LATENCY: Histogram = register_histogram!(
        format!("{}_ack_latency_seconds", METRIC_PREFIX),
        "Time from emit to acknowledgement",
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    // ============================================================================
    // Presence & Fan-out Metrics
    // ============================================================================

    /// Device presence transitions (online/offline)
    pub static ref PRESENCE_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_presence_transitions_total", METRIC_PREFIX),
        "Device presence boundary transitions",
        &["transition"]
    ).unwrap();

    /// Rooms with at least one local member
    pub static ref ROOMS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_rooms_active", METRIC_PREFIX),
        "Rooms with at least one local member"
    ).unwrap();

    /// Frames handed to local connections by room/device fan-out
    pub static ref FANOUT_DELIVERIES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_fanout_deliveries_total", METRIC_PREFIX),
        "Frames enqueued to local connections by fan-out"
    ).unwrap();

    /// Envelopes published on the bus
    pub static ref BUS_PUBLISHED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_bus_published_total", METRIC_PREFIX),
        "Envelopes published on the bus"
    ).unwrap();

    /// Envelopes received from the bus and replayed locally
    pub static ref BUS_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_bus_received_total", METRIC_PREFIX),
        "Envelopes received from the bus"
    ).unwrap();

    /// Envelopes dropped on receipt (own_origin, duplicate, malformed)
    pub static ref BUS_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_bus_dropped_total", METRIC_PREFIX),
        "Envelopes dropped on receipt",
        &["reason"]
    ).unwrap();

    /// Fallbacks to node-local operation after shared-store retries ran out
    pub static ref STORE_DEGRADATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_store_degradations_total", METRIC_PREFIX),
        "Fallbacks to node-local operation",
        &["component"]
    ).unwrap();

    // ============================================================================
    // Shared Store Metrics
    // ============================================================================

    /// Redis connection status (1 = connected, 0 = disconnected)
    pub static ref REDIS_CONNECTION_STATUS: IntGauge = register_int_gauge!(
        format!("{}_redis_connection_status", METRIC_PREFIX),
        "Redis connection status (1=connected, 0=disconnected)"
    ).unwrap();

    /// Redis circuit breaker state (0=closed, 1=open, 2=half-open)
    pub static ref REDIS_CIRCUIT_BREAKER_STATE: IntGauge = register_int_gauge!(
        format!("{}_redis_circuit_breaker_state", METRIC_PREFIX),
        "Redis circuit breaker state (0=closed, 1=open, 2=half-open)"
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        CONNECTIONS_ACTIVE.with_label_values(&["client"]).set(1);

        let output = encode_metrics().unwrap();
        assert!(output.contains("ara_rt_connections_active"));
    }

    #[test]
    fn test_helpers_record_without_panicking() {
        TransportMetrics::record_handshake("accepted");
        TransportMetrics::record_violation("invalid_json");
        TransportMetrics::record_event("join");
        AckMetrics::record_timeout();
        PresenceMetrics::record_transition(true);
        BusMetrics::record_dropped("duplicate");
        RedisMetrics::set_connected(true);
    }
}
