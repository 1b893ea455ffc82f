//! Metrics collection and export for Tether.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tether_core::{Envelope, Hub};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "tether_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tether_connections_active";
    pub const EVENTS_TOTAL: &str = "tether_socket_events_total";
    pub const FRAME_BYTES: &str = "tether_frame_bytes";
    pub const MESSAGES_SENT_TOTAL: &str = "tether_messages_sent_total";
    pub const NOTIFICATIONS_TOTAL: &str = "tether_notifications_total";
    pub const USERS_ONLINE: &str = "tether_users_online";
    pub const ROOMS_ACTIVE: &str = "tether_rooms_active";
    pub const LATENCY_SECONDS: &str = "tether_event_latency_seconds";
    pub const DELIVERY_SECONDS: &str = "tether_delivery_latency_seconds";
    pub const ERRORS_TOTAL: &str = "tether_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Client socket events by kind");
    metrics::describe_counter!(names::FRAME_BYTES, "Total bytes of socket frames");
    metrics::describe_counter!(names::MESSAGES_SENT_TOTAL, "Chat messages stored");
    metrics::describe_counter!(
        names::NOTIFICATIONS_TOTAL,
        "Offline notification decisions by outcome"
    );
    metrics::describe_gauge!(names::USERS_ONLINE, "Users with at least one connection");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Rooms with at least one member");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Socket event handling latency in seconds"
    );
    metrics::describe_histogram!(
        names::DELIVERY_SECONDS,
        "Time from routing an event to writing it to the socket"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a client event.
pub fn record_event(kind: &'static str) {
    counter!(names::EVENTS_TOTAL, "kind" => kind).increment(1);
}

/// Record a socket frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAME_BYTES, "direction" => direction).increment(bytes as u64);
}

pub fn record_message_sent() {
    counter!(names::MESSAGES_SENT_TOTAL).increment(1);
}

/// Record how a notification decision ended.
pub fn record_notification(outcome: &'static str) {
    counter!(names::NOTIFICATIONS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record event handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record how long an envelope waited between routing and the socket write.
pub fn record_delivery(envelope: &Envelope) {
    histogram!(names::DELIVERY_SECONDS).record(envelope.age(Utc::now()).as_secs_f64());
}

/// Refresh the presence and room gauges.
pub fn record_hub(hub: &Hub) {
    gauge!(names::USERS_ONLINE).set(hub.presence.online_count() as f64);
    gauge!(names::ROOMS_ACTIVE).set(hub.router.stats().room_count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
