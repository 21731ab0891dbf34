//! Prometheus metrics for Runway runtime operations
//!
//! This module defines metrics for unit outcomes and latency, retries,
//! blocked partitions, quality checks and concurrency waits.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, Histogram,
    HistogramVec, IntCounterVec,
};

lazy_static! {
    /// Units reaching a terminal outcome
    ///
    /// Labels:
    /// - outcome: "succeeded", "failed", "quarantined", "blocked", "cancelled"
    pub static ref UNITS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "runway_units_total",
        "Total number of materialization units by outcome",
        &["outcome"]
    )
    .expect("runway_units_total metric registration");

    /// Wall time of one unit from acquire to record
    ///
    /// Labels:
    /// - asset: asset name
    ///
    /// Buckets: 10ms to 10min
    pub static ref UNIT_DURATION: HistogramVec = register_histogram_vec!(
        "runway_unit_duration_seconds",
        "Duration of materialization units",
        &["asset"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0]
    )
    .expect("runway_unit_duration_seconds metric registration");

    /// Retries of transient failures
    ///
    /// Labels:
    /// - step: "load", "compute", "write"
    pub static ref RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "runway_retries_total",
        "Total number of retried unit steps",
        &["step"]
    )
    .expect("runway_retries_total metric registration");

    /// Quality check outcomes
    ///
    /// Labels:
    /// - severity: "blocking", "advisory"
    /// - outcome: "passed", "failed", "error"
    pub static ref QUALITY_CHECKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "runway_quality_checks_total",
        "Total number of quality check executions",
        &["severity", "outcome"]
    )
    .expect("runway_quality_checks_total metric registration");

    /// Time units spend waiting for concurrency permits
    pub static ref CONCURRENCY_WAIT_SECONDS: Histogram = register_histogram!(
        "runway_concurrency_wait_seconds",
        "Time spent waiting for unit permits",
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    )
    .expect("runway_concurrency_wait_seconds metric registration");
}
