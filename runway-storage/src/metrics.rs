//! Prometheus metrics for catalog operations
//!
//! This module defines metrics for:
//! - Catalog operation latency by backend
//! - Partition state writes by resulting state

use lazy_static::lazy_static;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

lazy_static! {
    /// Catalog operation duration histogram
    ///
    /// Labels:
    /// - backend: "memory", "file" or "postgres"
    /// - operation: "record_state", "get", "list_page" or "snapshot"
    pub static ref CATALOG_OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "runway_catalog_operation_duration_seconds",
        "Time spent in partition catalog operations",
        &["backend", "operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .expect("Failed to register catalog_operation_duration metric");

    /// Partition state writes counter
    ///
    /// Labels:
    /// - backend: catalog backend
    /// - state: state recorded by the write
    pub static ref CATALOG_STATE_WRITES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "runway_catalog_state_writes_total",
        "Total number of partition state writes",
        &["backend", "state"]
    )
    .expect("Failed to register catalog_state_writes_total metric");
}

/// Observe one catalog operation
pub(crate) fn observe(backend: &str, operation: &str, started: std::time::Instant) {
    CATALOG_OPERATION_DURATION
        .with_label_values(&[backend, operation])
        .observe(started.elapsed().as_secs_f64());
}

pub(crate) fn record_write(backend: &str, state: &str) {
    CATALOG_STATE_WRITES_TOTAL
        .with_label_values(&[backend, state])
        .inc();
}
