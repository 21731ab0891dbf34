//! Materialization units and the compute contract
//!
//! A unit is one (asset, partition) plus the upstream partitions it reads and
//! the input fingerprint computed from them. It is created at dispatch and
//! dropped once its terminal state is recorded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runway_core::{FetchError, Fingerprint, PartitionRef, ReadError, Row, WriteError};
use std::fmt;

/// One dispatched partition
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializationUnit {
    pub partition: PartitionRef,

    /// Mapped upstream partitions, sorted
    pub upstreams: Vec<PartitionRef>,

    /// Fingerprint of the upstream contributions read at dispatch
    pub input_fingerprint: Fingerprint,

    pub last_success_at: Option<DateTime<Utc>>,
}

/// Rows of one upstream partition
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamInput {
    pub partition: PartitionRef,
    pub rows: Vec<Row>,
}

/// Everything a compute sees for one unit
#[derive(Debug, Clone)]
pub struct ComputeContext {
    pub partition: PartitionRef,
    pub inputs: Vec<UpstreamInput>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// 1-based attempt number
    pub attempt: u32,
}

impl ComputeContext {
    /// Rows of every upstream partition of `asset`, in key order
    pub fn rows_of<'a>(&'a self, asset: &'a str) -> impl Iterator<Item = &'a Row> + 'a {
        self.inputs
            .iter()
            .filter(move |input| input.partition.asset == asset)
            .flat_map(|input| input.rows.iter())
    }

    /// Rows of all upstream partitions, in (asset, key) order
    pub fn all_rows(&self) -> impl Iterator<Item = &Row> {
        self.inputs.iter().flat_map(|input| input.rows.iter())
    }
}

/// Produces the rows of one asset kind
#[async_trait]
pub trait AssetCompute: Send + Sync {
    /// Short name for logs
    fn kind(&self) -> &'static str;

    /// Whether upstream rows must be loaded before `compute`
    fn reads_upstreams(&self) -> bool {
        true
    }

    async fn compute(&self, ctx: &ComputeContext) -> Result<Vec<Row>, UnitError>;
}

/// Errors a unit can hit between acquire and record
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UnitError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Write failed: {0}")]
    Write(#[from] WriteError),

    #[error("Reading upstream input failed: {0}")]
    Read(#[from] ReadError),

    #[error("Compute failed: {message}")]
    Compute { message: String, transient: bool },

    #[error("Unit panicked: {0}")]
    Panicked(String),

    #[error("Catalog update failed: {0}")]
    Catalog(String),

    #[error("Cancelled")]
    Cancelled,
}

impl UnitError {
    pub fn compute(message: impl Into<String>) -> Self {
        UnitError::Compute {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        UnitError::Compute {
            message: message.into(),
            transient: true,
        }
    }

    /// Whether retrying the failed step can succeed
    pub fn is_transient(&self) -> bool {
        match self {
            UnitError::Fetch(e) => e.is_transient(),
            UnitError::Write(e) => e.is_transient(),
            UnitError::Read(e) => e.is_transient(),
            UnitError::Compute { transient, .. } => *transient,
            UnitError::Panicked(_) | UnitError::Catalog(_) | UnitError::Cancelled => false,
        }
    }
}

/// Step of unit execution, used for retry accounting and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitStep {
    Acquire,
    Load,
    Compute,
    Write,
    Gate,
    Record,
}

impl UnitStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStep::Acquire => "acquire",
            UnitStep::Load => "load",
            UnitStep::Compute => "compute",
            UnitStep::Write => "write",
            UnitStep::Gate => "gate",
            UnitStep::Record => "record",
        }
    }
}

impl fmt::Display for UnitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(UnitError::Fetch(FetchError::Transient("timeout".into())).is_transient());
        assert!(!UnitError::Fetch(FetchError::Permanent("404".into())).is_transient());
        assert!(UnitError::Write(WriteError::Transient("lock".into())).is_transient());
        assert!(!UnitError::Write(WriteError::SchemaMismatch("col".into())).is_transient());
        assert!(UnitError::transient("flaky").is_transient());
        assert!(!UnitError::compute("bad input").is_transient());
        assert!(!UnitError::Panicked("boom".into()).is_transient());
    }

    #[test]
    fn test_rows_of_filters_by_asset() {
        let row = |v: i64| {
            let mut r = Row::new();
            r.insert("v".into(), v.into());
            r
        };
        let ctx = ComputeContext {
            partition: PartitionRef::new("enriched", "2024-03-01"),
            inputs: vec![
                UpstreamInput {
                    partition: PartitionRef::new("flights", "2024-03-01"),
                    rows: vec![row(1), row(2)],
                },
                UpstreamInput {
                    partition: PartitionRef::new("weather", "2024-03-01"),
                    rows: vec![row(3)],
                },
            ],
            last_success_at: None,
            attempt: 1,
        };
        assert_eq!(ctx.rows_of("flights").count(), 2);
        assert_eq!(ctx.all_rows().count(), 3);
    }
}
