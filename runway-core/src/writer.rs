//! Storage writer and reader contracts
//!
//! The engine never talks to a storage engine directly. Materialization units
//! hand their rows to a [`StorageWriter`], which must upsert idempotently: the
//! same rows written twice for the same partition produce the same stored state
//! and the same commit fingerprint. Downstream units and referential checks
//! read committed partitions back through a [`StorageReader`].

use crate::partition::{Fingerprint, PartitionKey, Row};
use async_trait::async_trait;

/// Errors returned by a storage writer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// Connection drops, lock timeouts and similar conditions worth retrying
    #[error("Transient write failure: {0}")]
    Transient(String),

    /// Rows do not fit the target table; retrying cannot succeed
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
}

impl WriteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WriteError::Transient(_))
    }
}

/// Errors returned by a storage reader
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("No committed data for {asset}[{key}]")]
    NotFound { asset: String, key: String },

    #[error("Transient read failure: {0}")]
    Transient(String),

    #[error("Read failed: {0}")]
    Other(String),
}

impl ReadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ReadError::Transient(_))
    }
}

/// Idempotent upsert of one partition's rows
#[async_trait]
pub trait StorageWriter: Send + Sync {
    /// Replace the contents of `asset[key]` with `rows` and return the commit fingerprint
    async fn upsert(
        &self,
        asset: &str,
        key: &PartitionKey,
        rows: &[Row],
    ) -> Result<Fingerprint, WriteError>;
}

/// Read access to committed partitions
#[async_trait]
pub trait StorageReader: Send + Sync {
    async fn read(&self, asset: &str, key: &PartitionKey) -> Result<Vec<Row>, ReadError>;
}
