//! # Runway Storage
//!
//! Persistence for the Runway materialization engine: the partition catalog
//! (in-memory, JSON file and PostgreSQL backends) and the reference output
//! stores used by the CLI and tests.

pub mod catalog;
pub mod file;
pub mod memory;
pub mod metrics;
pub mod migrations;
pub mod models;
pub mod output_store;
pub mod postgres;

// Re-export commonly used types
pub use catalog::{PartitionCatalog, StateChange};
pub use file::FileCatalog;
pub use memory::InMemoryCatalog;
pub use output_store::{commit_fingerprint, FileStore, MemoryStore};
pub use postgres::{PoolConfig, PostgresCatalog};

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Corrupt catalog record: {0}")]
    Corrupt(String),

    #[error("Catalog lock poisoned")]
    LockPoisoned,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
