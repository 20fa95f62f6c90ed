//! Metrics facade.
//!
//! Thin wrappers over the `metrics` macros so call sites stay one-liners and
//! the metric names live in a single file. A recorder (Prometheus exporter,
//! statsd, ...) is installed by the embedding application; without one these
//! are no-ops.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

pub fn set_outgoing_connections(count: usize) {
    gauge!("replication_outgoing_connections").set(count as f64);
}

pub fn set_incoming_connections(count: usize) {
    gauge!("replication_incoming_connections").set(count as f64);
}

pub fn set_reconnect_queue_len(count: usize) {
    gauge!("replication_reconnect_queue_len").set(count as f64);
}

pub fn record_outgoing_batch(destination: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_outgoing_batches_total",
        "destination" => destination.to_string(), "status" => status)
    .increment(1);
}

pub fn record_incoming_batch(source: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_incoming_batches_total",
        "source" => source.to_string(), "status" => status)
    .increment(1);
}

pub fn record_reconnect_attempt(destination: &str) {
    counter!("replication_reconnect_attempts_total",
        "destination" => destination.to_string())
    .increment(1);
}

pub fn record_rejected_connection(source: &str) {
    counter!("replication_rejected_connections_total",
        "source" => source.to_string())
    .increment(1);
}

pub fn record_heartbeat(destination: &str) {
    counter!("replication_heartbeats_total",
        "destination" => destination.to_string())
    .increment(1);
}

pub fn record_quorum_wait(elapsed: Duration, satisfied: bool) {
    let status = if satisfied { "satisfied" } else { "timeout" };
    histogram!("replication_quorum_wait_seconds", "status" => status)
        .record(elapsed.as_secs_f64());
}
