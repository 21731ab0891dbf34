//! # Runway Runtime
//!
//! Execution runtime for Runway: staleness resolution, the materialization
//! scheduler with its retry and concurrency control, the data quality gate,
//! built-in computes and backfill planning.

pub mod backfill;
pub mod checks;
pub mod compute;
pub mod concurrency;
pub mod metrics;
pub mod orchestrator;
pub mod quality_gate;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod state_machine;
pub mod unit;

// Re-export commonly used types
pub use backfill::{BackfillController, BackfillMode, BackfillRequest};
pub use checks::BuiltinCheckRunner;
pub use compute::ComputeRegistry;
pub use concurrency::{PartitionLocks, ResourceLimiter};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use quality_gate::{CheckRunner, DataQualityGate, GateVerdict, MaterializedOutput};
pub use report::{OutcomeCounts, RunReport, UnitOutcome};
pub use resolver::{ResolveRequest, StaleReason, StalenessResolver, WorkItem, WorkSet};
pub use retry::{RetryPolicy, RetryStrategy};
pub use scheduler::{MaterializationScheduler, SchedulerBuilder};
pub use state_machine::StateMachine;
pub use unit::{AssetCompute, ComputeContext, MaterializationUnit, UnitError, UpstreamInput};

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for runtime operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Graph error: {0}")]
    Graph(#[from] runway_core::GraphError),

    #[error("Selection error: {0}")]
    Selection(#[from] runway_core::SelectionError),

    #[error("Partition range error: {0}")]
    KeyRange(#[from] runway_core::KeyRangeError),

    #[error("Catalog error: {0}")]
    Storage(#[from] runway_storage::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backfill of {asset} covers {count} partitions, above the limit of {limit}")]
    BackfillTooLarge {
        asset: String,
        count: usize,
        limit: usize,
    },

    #[error("No compute registered for asset {0}")]
    MissingCompute(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error stems from configuration rather than execution
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::Graph(_)
                | Error::Selection(_)
                | Error::KeyRange(_)
                | Error::Config(_)
                | Error::BackfillTooLarge { .. }
                | Error::MissingCompute(_)
        )
    }
}
