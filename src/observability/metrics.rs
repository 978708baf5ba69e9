//! Metrics collection and exposition.
//!
//! # Metrics
//! - `edge_connections_accepted_total` (counter): connections handed to HTTP serving
//! - `edge_connections_rejected_total` (counter): connections closed by admission control
//! - `edge_connections_active` (gauge): admitted connections currently open
//! - `edge_trust_decisions_total` (counter): trust decisions by result
//! - `edge_dns_lookup_failures_total` (counter): failed lookups by stage
//! - `edge_listener_bind_failures_total` (counter): bind failures by kind
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Prometheus exporter is optional and owned by the binary

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::net::connection::Rejection;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint started"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to start metrics endpoint"),
    }
}

pub fn record_connection_accepted(listener: &str) {
    metrics::counter!("edge_connections_accepted_total", "listener" => listener.to_string()).increment(1);
}

pub fn record_connection_rejected(reason: Rejection) {
    let reason = match reason {
        Rejection::AtCapacity => "at_capacity",
        Rejection::Closed => "shutting_down",
    };
    metrics::counter!("edge_connections_rejected_total", "reason" => reason).increment(1);
}

pub fn set_active_connections(active: usize) {
    metrics::gauge!("edge_connections_active").set(active as f64);
}

pub fn record_trust_decision(allowed: bool) {
    let result = if allowed { "trusted" } else { "denied" };
    metrics::counter!("edge_trust_decisions_total", "result" => result).increment(1);
}

pub fn record_dns_failure(stage: &'static str) {
    metrics::counter!("edge_dns_lookup_failures_total", "stage" => stage).increment(1);
}

pub fn record_bind_failure(kind: &'static str) {
    metrics::counter!("edge_listener_bind_failures_total", "kind" => kind).increment(1);
}
