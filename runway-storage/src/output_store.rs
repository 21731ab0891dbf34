//! Reference storage writers
//!
//! [`MemoryStore`] backs tests and dry runs, [`FileStore`] writes one JSON
//! document per partition under a data directory. Both replace a partition's
//! rows wholesale, so writing the same rows twice yields the same stored state
//! and the same commit fingerprint.

use async_trait::async_trait;
use runway_core::{
    Fingerprint, PartitionKey, ReadError, Row, StorageReader, StorageWriter, WriteError,
};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, instrument};

use crate::file::write_atomic;

/// Commit fingerprint of a partition's rows
///
/// Rows are serialized with sorted keys, so column order in the producer does
/// not change the fingerprint.
pub fn commit_fingerprint(rows: &[Row]) -> Fingerprint {
    // serde_json::Map is a BTreeMap without the preserve_order feature
    let bytes = serde_json::to_vec(rows).unwrap_or_default();
    Fingerprint::digest(&bytes)
}

fn validate_schema(asset: &str, columns: &BTreeSet<String>, rows: &[Row]) -> Result<(), WriteError> {
    for (idx, row) in rows.iter().enumerate() {
        if let Some(unknown) = row.keys().find(|k| !columns.contains(*k)) {
            return Err(WriteError::SchemaMismatch(format!(
                "{}: row {} has unknown column '{}'",
                asset, idx, unknown
            )));
        }
    }
    Ok(())
}

type PartitionTable = HashMap<(String, PartitionKey), Vec<Row>>;

/// In-memory storage writer and reader
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    partitions: Arc<RwLock<PartitionTable>>,
    schemas: Arc<HashMap<String, BTreeSet<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict `asset` to `columns`; writes with other columns are rejected
    pub fn with_schema<I, S>(mut self, asset: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut schemas = (*self.schemas).clone();
        schemas.insert(asset.into(), columns.into_iter().map(Into::into).collect());
        self.schemas = Arc::new(schemas);
        self
    }

    /// Rows currently stored for a partition
    pub fn rows(&self, asset: &str, key: &PartitionKey) -> Option<Vec<Row>> {
        self.partitions
            .read()
            .ok()?
            .get(&(asset.to_string(), key.clone()))
            .cloned()
    }

    /// Number of stored partitions
    pub fn partition_count(&self) -> usize {
        self.partitions.read().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl StorageWriter for MemoryStore {
    async fn upsert(
        &self,
        asset: &str,
        key: &PartitionKey,
        rows: &[Row],
    ) -> Result<Fingerprint, WriteError> {
        if let Some(columns) = self.schemas.get(asset) {
            validate_schema(asset, columns, rows)?;
        }

        let mut partitions = self
            .partitions
            .write()
            .map_err(|_| WriteError::Transient("store lock poisoned".to_string()))?;
        partitions.insert((asset.to_string(), key.clone()), rows.to_vec());
        Ok(commit_fingerprint(rows))
    }
}

#[async_trait]
impl StorageReader for MemoryStore {
    async fn read(&self, asset: &str, key: &PartitionKey) -> Result<Vec<Row>, ReadError> {
        let partitions = self
            .partitions
            .read()
            .map_err(|_| ReadError::Transient("store lock poisoned".to_string()))?;
        partitions
            .get(&(asset.to_string(), key.clone()))
            .cloned()
            .ok_or_else(|| ReadError::NotFound {
                asset: asset.to_string(),
                key: key.to_string(),
            })
    }
}

/// Writes each partition to `<root>/<asset>/<key>.json`
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_path(&self, asset: &str, key: &PartitionKey) -> PathBuf {
        self.root.join(asset).join(format!("{}.json", key))
    }
}

#[async_trait]
impl StorageWriter for FileStore {
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert(
        &self,
        asset: &str,
        key: &PartitionKey,
        rows: &[Row],
    ) -> Result<Fingerprint, WriteError> {
        let path = self.partition_path(asset, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WriteError::Transient(e.to_string()))?;
        }

        let bytes = serde_json::to_vec_pretty(rows)
            .map_err(|e| WriteError::SchemaMismatch(e.to_string()))?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|e| WriteError::Transient(e.to_string()))?;

        debug!(path = %path.display(), "Wrote partition");
        Ok(commit_fingerprint(rows))
    }
}

#[async_trait]
impl StorageReader for FileStore {
    async fn read(&self, asset: &str, key: &PartitionKey) -> Result<Vec<Row>, ReadError> {
        let path = self.partition_path(asset, key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReadError::NotFound {
                    asset: asset.to_string(),
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(ReadError::Transient(e.to_string())),
        };
        serde_json::from_slice(&bytes).map_err(|e| ReadError::Other(e.to_string()))
    }
}
