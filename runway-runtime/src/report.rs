//! Run reports

use chrono::{DateTime, Utc};
use runway_core::{CheckId, Fingerprint, PartitionRef};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Terminal outcome of one work-set partition
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Succeeded {
        row_count: u64,
        output_fingerprint: Fingerprint,
        /// Compute attempts used
        attempts: u32,
    },
    Failed {
        error: String,
        attempts: u32,
    },
    Quarantined {
        failed_checks: Vec<CheckId>,
    },
    /// Never dispatched because an upstream did not succeed
    Blocked {
        by: PartitionRef,
    },
    /// Stopped by cancellation before committing
    Cancelled,
}

impl UnitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitOutcome::Succeeded { .. } => "succeeded",
            UnitOutcome::Failed { .. } => "failed",
            UnitOutcome::Quarantined { .. } => "quarantined",
            UnitOutcome::Blocked { .. } => "blocked",
            UnitOutcome::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Succeeded { .. })
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOutcome::Succeeded { row_count, .. } => write!(f, "succeeded ({} rows)", row_count),
            UnitOutcome::Failed { error, attempts } => {
                write!(f, "failed after {} attempt(s): {}", attempts, error)
            }
            UnitOutcome::Quarantined { failed_checks } => {
                let ids: Vec<&str> = failed_checks.iter().map(|c| c.as_str()).collect();
                write!(f, "quarantined by {}", ids.join(", "))
            }
            UnitOutcome::Blocked { by } => write!(f, "blocked by {}", by),
            UnitOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Partitions per terminal outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub quarantined: usize,
    pub blocked: usize,
    pub cancelled: usize,
}

impl OutcomeCounts {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.quarantined + self.blocked + self.cancelled
    }
}

/// Result of one scheduler run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: BTreeMap<PartitionRef, UnitOutcome>,
    /// Partitions in the order units were dispatched
    pub dispatch_order: Vec<PartitionRef>,
    /// Partitions in the order units finished
    pub completion_order: Vec<PartitionRef>,
}

impl RunReport {
    /// Report for a run with nothing to do
    pub fn empty() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            outcomes: BTreeMap::new(),
            dispatch_order: Vec::new(),
            completion_order: Vec::new(),
        }
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for outcome in self.outcomes.values() {
            match outcome {
                UnitOutcome::Succeeded { .. } => counts.succeeded += 1,
                UnitOutcome::Failed { .. } => counts.failed += 1,
                UnitOutcome::Quarantined { .. } => counts.quarantined += 1,
                UnitOutcome::Blocked { .. } => counts.blocked += 1,
                UnitOutcome::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn outcome(&self, partition: &PartitionRef) -> Option<&UnitOutcome> {
        self.outcomes.get(partition)
    }

    /// Partitions that ended with the given outcome name
    pub fn partitions_with(&self, outcome: &str) -> Vec<&PartitionRef> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.as_str() == outcome)
            .map(|(p, _)| p)
            .collect()
    }

    /// Partitions that did not succeed
    pub fn unsuccessful(&self) -> impl Iterator<Item = (&PartitionRef, &UnitOutcome)> {
        self.outcomes.iter().filter(|(_, o)| !o.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(UnitOutcome::is_success)
    }

    /// Process exit code: 0 when every partition succeeded, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcomes: Vec<(&str, UnitOutcome)>) -> RunReport {
        let mut report = RunReport::empty();
        for (asset, outcome) in outcomes {
            report
                .outcomes
                .insert(PartitionRef::new(asset, "2024-03-01"), outcome);
        }
        report
    }

    fn succeeded() -> UnitOutcome {
        UnitOutcome::Succeeded {
            row_count: 3,
            output_fingerprint: Fingerprint::from_hex("ab"),
            attempts: 1,
        }
    }

    #[test]
    fn test_empty_report_is_success() {
        let report = RunReport::empty();
        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.counts().total(), 0);
    }

    #[test]
    fn test_counts_and_exit_code() {
        let report = report(vec![
            ("a", succeeded()),
            (
                "b",
                UnitOutcome::Failed {
                    error: "boom".into(),
                    attempts: 4,
                },
            ),
            (
                "c",
                UnitOutcome::Blocked {
                    by: PartitionRef::new("b", "2024-03-01"),
                },
            ),
        ]);

        let counts = report.counts();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.blocked, 1);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.partitions_with("blocked").len(), 1);
        assert_eq!(report.unsuccessful().count(), 2);
    }

    #[test]
    fn test_cancelled_is_not_success() {
        let report = report(vec![("a", succeeded()), ("b", UnitOutcome::Cancelled)]);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_outcome_display() {
        let outcome = UnitOutcome::Quarantined {
            failed_checks: vec![CheckId::new("not_null_airline")],
        };
        assert_eq!(outcome.to_string(), "quarantined by not_null_airline");
    }
}
