//! Data quality gate
//!
//! Runs every declared check against freshly committed output before the
//! partition is marked usable downstream. All checks run, even after a
//! blocking failure, so the catalog always holds the full picture.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use runway_core::{
    CheckOutcome, DataQualityResult, PartitionRef, QualityCheck, QualitySummary, Row,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::metrics::QUALITY_CHECKS_TOTAL;

/// Rows committed by one unit
#[derive(Debug, Clone)]
pub struct MaterializedOutput {
    pub partition: PartitionRef,
    pub rows: Vec<Row>,
    pub committed_at: DateTime<Utc>,
}

impl MaterializedOutput {
    pub fn new(partition: PartitionRef, rows: Vec<Row>) -> Self {
        Self {
            partition,
            rows,
            committed_at: Utc::now(),
        }
    }
}

/// Executes a single check
#[async_trait]
pub trait CheckRunner: Send + Sync {
    async fn run(&self, check: &QualityCheck, output: &MaterializedOutput) -> DataQualityResult;
}

/// Result of gating one partition
#[derive(Debug, Clone)]
pub struct GateVerdict {
    pub results: Vec<DataQualityResult>,
    pub summary: QualitySummary,
}

impl GateVerdict {
    /// Whether the partition may be marked succeeded
    pub fn passed(&self) -> bool {
        !self.summary.has_blocking_failures
    }

    /// Ids of blocking checks that failed or errored
    pub fn blocking_failures(&self) -> Vec<runway_core::CheckId> {
        self.results
            .iter()
            .filter(|r| r.is_blocking_failure())
            .map(|r| r.check_id.clone())
            .collect()
    }
}

/// Evaluates a partition's checks
#[derive(Clone)]
pub struct DataQualityGate {
    runner: Arc<dyn CheckRunner>,
}

impl DataQualityGate {
    pub fn new(runner: Arc<dyn CheckRunner>) -> Self {
        Self { runner }
    }

    #[instrument(
        name = "quality_gate.evaluate",
        skip(self, checks, output),
        fields(partition = %output.partition, checks = checks.len())
    )]
    pub async fn evaluate(
        &self,
        checks: &[QualityCheck],
        output: &MaterializedOutput,
    ) -> GateVerdict {
        let results = join_all(
            checks
                .iter()
                .filter(|check| check.enabled)
                .map(|check| self.runner.run(check, output)),
        )
        .await;

        for result in &results {
            QUALITY_CHECKS_TOTAL
                .with_label_values(&[result.severity.as_str(), result.outcome.as_str()])
                .inc();

            if result.outcome != CheckOutcome::Passed && !result.is_blocking_failure() {
                warn!(
                    check_id = %result.check_id,
                    outcome = %result.outcome,
                    message = result.message.as_deref().unwrap_or(""),
                    "Advisory check did not pass"
                );
            }
        }

        let summary = QualitySummary::from_results(&results);
        if summary.has_blocking_failures {
            warn!(
                failed = summary.failed,
                errors = summary.errors,
                "Blocking check failed, partition will be quarantined"
            );
        } else if summary.total > 0 {
            info!(passed = summary.passed, total = summary.total, "Quality gate passed");
        }

        GateVerdict { results, summary }
    }
}
