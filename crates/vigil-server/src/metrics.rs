//! Prometheus metrics for Vigil.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "vigil_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "vigil_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "vigil_connections_rejected_total";
    pub const EVENTS_TOTAL: &str = "vigil_events_total";
    pub const EVENTS_BYTES: &str = "vigil_events_bytes";
    pub const EVENT_ERRORS_TOTAL: &str = "vigil_event_errors_total";
    pub const DISPATCH_SECONDS: &str = "vigil_dispatch_seconds";
    pub const MESSAGES_SENT: &str = "vigil_messages_sent_total";
    pub const CALLS_ACTIVE: &str = "vigil_calls_active";
    pub const ERRORS_TOTAL: &str = "vigil_errors_total";
}

/// Describe all metrics.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open sockets"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Upgrade requests refused, by reason"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Events processed, by name and direction");
    metrics::describe_counter!(names::EVENTS_BYTES, "Encoded event bytes, by direction");
    metrics::describe_counter!(
        names::EVENT_ERRORS_TOTAL,
        "Client events rejected, by event and error kind"
    );
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Time spent handling one client event"
    );
    metrics::describe_counter!(names::MESSAGES_SENT, "Chat messages accepted");
    metrics::describe_gauge!(names::CALLS_ACTIVE, "Calls that have not ended");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Transport errors");

    info!("Metrics initialized");
}

/// Start the Prometheus exporter.
///
/// # Errors
///
/// Returns an error if the listener cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub fn record_rejected(reason: &'static str) {
    counter!(names::CONNECTIONS_REJECTED, "reason" => reason).increment(1);
}

/// Record one event crossing the socket.
pub fn record_event(event: &'static str, direction: &'static str, bytes: usize) {
    counter!(names::EVENTS_TOTAL, "event" => event, "direction" => direction).increment(1);
    counter!(names::EVENTS_BYTES, "direction" => direction).increment(bytes as u64);
}

pub fn record_event_error(event: &'static str, kind: &'static str) {
    counter!(names::EVENT_ERRORS_TOTAL, "event" => event, "kind" => kind).increment(1);
}

pub fn record_dispatch(seconds: f64) {
    histogram!(names::DISPATCH_SECONDS).record(seconds);
}

pub fn record_message_sent() {
    counter!(names::MESSAGES_SENT).increment(1);
}

pub fn set_active_calls(count: usize) {
    gauge!(names::CALLS_ACTIVE).set(count as f64);
}

/// Record a transport error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Counts a socket as open for as long as it lives.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
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
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter() {
        // No recorder installed: every call is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_event("message:send", "inbound", 42);
        record_event_error("message:send", "forbidden");
        record_dispatch(0.001);
        record_message_sent();
        set_active_calls(3);
    }
}
