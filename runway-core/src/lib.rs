//! # Runway Core
//!
//! Core model for the Runway materialization engine: asset definitions, the
//! dependency graph, partitions and their mappings, quality check
//! definitions, pipeline configuration, and the contracts for external
//! sources and storage.

pub mod asset;
pub mod config;
pub mod graph;
pub mod partition;
pub mod partition_mapping;
pub mod quality;
pub mod selection;
pub mod source;
pub mod writer;

// Re-export commonly used types
pub use asset::{AssetNode, AssetNodeBuilder, PartitionDimension, StalenessPolicy};
pub use config::{
    Aggregate, AggregateFunction, CatalogSettings, ComputeSpec, ConfigError, PipelineConfig,
    PipelineDefinition, RetrySettings, Settings,
};
pub use graph::{AssetGraph, Dependency, GraphError};
pub use partition::{
    Fingerprint, KeyRange, KeyRangeError, PartitionKey, PartitionRecord, PartitionRef,
    PartitionState, Row, UNPARTITIONED_KEY,
};
pub use partition_mapping::{infer_mapping, PartitionMapping, PartitionMappingError};
pub use quality::{
    CheckId, CheckOutcome, CheckSeverity, CheckType, DataQualityResult, QualityCheck,
    QualitySummary,
};
pub use selection::{AssetSelection, SelectionError};
pub use source::{FetchError, SourceFetcher, Watermark};
pub use writer::{ReadError, StorageReader, StorageWriter, WriteError};

/// Result type for Runway core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Runway core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("Partition range error: {0}")]
    KeyRange(#[from] KeyRangeError),

    #[error("Partition mapping error: {0}")]
    Mapping(#[from] PartitionMappingError),

    #[error("Internal error: {0}")]
    Internal(String),
}
