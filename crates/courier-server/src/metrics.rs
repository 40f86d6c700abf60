//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports to Prometheus
//! format on a dedicated port.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const CHANNELS_ACTIVE: &str = "courier_channels_active";
    pub const MESSAGES_TOTAL: &str = "courier_messages_total";
    pub const POLLING_SESSIONS_ACTIVE: &str = "courier_polling_sessions_active";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of connected clients"
    );
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of open channels");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of envelopes relayed");
    metrics::describe_gauge!(
        names::POLLING_SESSIONS_ACTIVE,
        "Current number of live long-polling sessions"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection on a transport.
pub fn record_connection(transport: &'static str) {
    counter!(names::CONNECTIONS_TOTAL, "transport" => transport).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a relayed envelope.
pub fn record_message(direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
}

/// Update the open channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

/// Update the live polling session count.
pub fn set_polling_sessions(count: usize) {
    gauge!(names::POLLING_SESSIONS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Guard that pairs a connection record with a disconnection on drop.
pub struct ConnectionGuard;

impl ConnectionGuard {
    /// Record a connection on `transport` and return the guard.
    #[must_use]
    pub fn new(transport: &'static str) -> Self {
        record_connection(transport);
        Self
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_guard() {
        // Records against the global recorder without panicking.
        let _guard = ConnectionGuard::new("test");
    }
}
