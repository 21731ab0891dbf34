//! Custom assertions for common verification patterns
//!
//! Provides assertion helpers that give better error messages when a run
//! report or catalog record does not look as expected.

use runway_core::{PartitionRef, PartitionState};
use runway_runtime::{RunReport, UnitOutcome};

use crate::builders::TestHarness;

/// Run report assertion helpers
pub struct ReportAssertions<'a> {
    report: &'a RunReport,
}

impl<'a> ReportAssertions<'a> {
    pub fn new(report: &'a RunReport) -> Self {
        Self { report }
    }

    fn outcome(&self, asset: &str, key: &str) -> &'a UnitOutcome {
        let partition = PartitionRef::new(asset, key);
        self.report.outcome(&partition).unwrap_or_else(|| {
            panic!(
                "{} is not in the report; outcomes: {:?}",
                partition,
                self.report.outcomes.keys().map(ToString::to_string).collect::<Vec<_>>()
            )
        })
    }

    /// Assert the outcome name of one partition, e.g. "succeeded"
    pub fn assert_outcome(self, asset: &str, key: &str, expected: &str) -> Self {
        let outcome = self.outcome(asset, key);
        assert_eq!(
            outcome.as_str(),
            expected,
            "Expected {}[{}] to be {} but it was {}",
            asset,
            key,
            expected,
            outcome
        );
        self
    }

    pub fn assert_succeeded(self, asset: &str, key: &str) -> Self {
        self.assert_outcome(asset, key, "succeeded")
    }

    pub fn assert_failed(self, asset: &str, key: &str) -> Self {
        self.assert_outcome(asset, key, "failed")
    }

    pub fn assert_quarantined(self, asset: &str, key: &str) -> Self {
        self.assert_outcome(asset, key, "quarantined")
    }

    /// Assert a partition was blocked by a specific upstream partition
    pub fn assert_blocked_by(self, asset: &str, key: &str, upstream: &PartitionRef) -> Self {
        match self.outcome(asset, key) {
            UnitOutcome::Blocked { by } => assert_eq!(
                by, upstream,
                "Expected {}[{}] to be blocked by {} but it was blocked by {}",
                asset, key, upstream, by
            ),
            other => panic!("Expected {}[{}] to be blocked but it was {}", asset, key, other),
        }
        self
    }

    /// Assert the number of partitions per outcome:
    /// (succeeded, failed, quarantined, blocked, cancelled)
    pub fn assert_counts(self, expected: (usize, usize, usize, usize, usize)) -> Self {
        let c = self.report.counts();
        assert_eq!(
            (c.succeeded, c.failed, c.quarantined, c.blocked, c.cancelled),
            expected,
            "Unexpected outcome counts (succeeded, failed, quarantined, blocked, cancelled)"
        );
        self
    }

    pub fn assert_exit_code(self, expected: i32) -> Self {
        assert_eq!(self.report.exit_code(), expected, "Unexpected exit code");
        self
    }

    /// Assert every partition of `before` was dispatched ahead of every
    /// partition of `after`
    pub fn assert_dispatched_before(self, before: &str, after: &str) -> Self {
        let order = &self.report.dispatch_order;
        let last_before = order.iter().rposition(|p| p.asset == before);
        let first_after = order.iter().position(|p| p.asset == after);
        if let (Some(last_before), Some(first_after)) = (last_before, first_after) {
            assert!(
                last_before < first_after,
                "Expected {} to be dispatched before {}; order: {:?}",
                before,
                after,
                order.iter().map(ToString::to_string).collect::<Vec<_>>()
            );
        }
        self
    }
}

/// Assert the stored state of one partition
pub async fn assert_state(harness: &TestHarness, asset: &str, key: &str, expected: PartitionState) {
    let record = harness.record(asset, key).await;
    assert_eq!(
        record.state, expected,
        "Expected catalog state of {}[{}] to be {} but it was {}",
        asset, key, expected, record.state
    );
}

/// Assert nothing is stale for `select` over `partition`
pub async fn assert_up_to_date(harness: &TestHarness, select: &str, partition: &str) {
    let work = harness.stale(select, partition).await;
    assert!(
        work.is_empty(),
        "Expected nothing stale for {} but found: {:?}",
        select,
        work.partitions().map(ToString::to_string).collect::<Vec<_>>()
    );
}
