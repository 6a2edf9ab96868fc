//! Prometheus metrics for the node plugin.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: node RPC operations by verb and status
    pub const NODE_OPERATIONS_TOTAL: &str = "csi_node_operations_total";
    /// Histogram: node RPC operation duration in seconds
    pub const NODE_OPERATION_DURATION_SECONDS: &str = "csi_node_operation_duration_seconds";
    /// Counter: supervisor-driven remount attempts by outcome
    pub const NODE_REMOUNTS_TOTAL: &str = "csi_node_remounts_total";
    /// Gauge: volumes currently tracked in the registry
    pub const NODE_VOLUMES_MANAGED: &str = "csi_node_volumes_managed";
}

/// Install the Prometheus exporter serving `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a completed node operation.
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::NODE_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::NODE_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record the outcome of a supervisor remount attempt.
pub fn record_remount(outcome: &str) {
    counter!(names::NODE_REMOUNTS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// Track how many volumes the registry currently holds.
pub fn set_volumes_managed(count: usize) {
    gauge!(names::NODE_VOLUMES_MANAGED).set(count as f64);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, error_code, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_timer_records_without_exporter() {
        // Recording without an installed exporter must not panic.
        let timer = OperationTimer::new("node_publish_volume");
        timer.success();
        let timer = OperationTimer::new("node_publish_volume");
        timer.failure("Internal");
        record_remount("success");
        set_volumes_managed(3);
    }
}
