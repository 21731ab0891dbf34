//! JSON file partition catalog
//!
//! The whole catalog lives in one JSON document that is rewritten on every
//! state change. The new document is written to a sibling temp file and renamed
//! over the old one, so a crash leaves either the previous or the next version
//! on disk, never a torn write. Intended for single-process CLI use.

use async_trait::async_trait;
use chrono::Utc;
use runway_core::{KeyRange, PartitionKey, PartitionRecord, PartitionRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::catalog::{complete_snapshot, PartitionCatalog, StateChange};
use crate::metrics;
use crate::memory::page_from_map;
use crate::{Error, Result};

const CATALOG_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CatalogDocument {
    version: u32,
    partitions: Vec<PartitionRecord>,
}

/// Catalog persisted to a single JSON file
#[derive(Debug)]
pub struct FileCatalog {
    path: PathBuf,
    records: Mutex<BTreeMap<PartitionRef, PartitionRecord>>,
}

impl FileCatalog {
    /// Open the catalog at `path`, starting empty if the file does not exist
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let document: CatalogDocument = serde_json::from_slice(&bytes)?;
                if document.version != CATALOG_FORMAT_VERSION {
                    return Err(Error::Corrupt(format!(
                        "unsupported catalog version {} in {}",
                        document.version,
                        path.display()
                    )));
                }
                document
                    .partitions
                    .into_iter()
                    .map(|record| (record.partition_ref(), record))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(partitions = records.len(), "Opened file catalog");

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &BTreeMap<PartitionRef, PartitionRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let document = CatalogDocument {
            version: CATALOG_FORMAT_VERSION,
            partitions: records.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&document)?;

        write_atomic(&self.path, &bytes).await?;
        Ok(())
    }
}

/// Write `bytes` to a synced sibling temp file, then rename it over `path`
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl PartitionCatalog for FileCatalog {
    async fn record_state(&self, change: StateChange) -> Result<PartitionRecord> {
        let started = Instant::now();
        let mut records = self.records.lock().await;
        let current = records.get(&change.partition).cloned();
        let record = change.apply(current.clone(), Utc::now());
        records.insert(change.partition.clone(), record.clone());

        if let Err(e) = self.persist(&records).await {
            // Keep memory consistent with disk
            match current {
                Some(previous) => records.insert(change.partition.clone(), previous),
                None => records.remove(&change.partition),
            };
            return Err(e);
        }

        debug!(
            partition = %change.partition,
            state = %record.state,
            "Recorded partition state"
        );
        metrics::record_write("file", record.state.as_str());
        metrics::observe("file", "record_state", started);
        Ok(record)
    }

    async fn get(&self, partition: &PartitionRef) -> Result<Option<PartitionRecord>> {
        Ok(self.records.lock().await.get(partition).cloned())
    }

    async fn list_page(
        &self,
        asset: &str,
        range: &KeyRange,
        after: Option<&PartitionKey>,
        limit: usize,
    ) -> Result<Vec<PartitionRecord>> {
        let records = self.records.lock().await;
        Ok(page_from_map(&records, asset, range, after, limit))
    }

    async fn snapshot(
        &self,
        partitions: &[PartitionRef],
    ) -> Result<BTreeMap<PartitionRef, PartitionRecord>> {
        let records = self.records.lock().await;
        let found = partitions
            .iter()
            .filter_map(|p| records.get(p).map(|r| (p.clone(), r.clone())))
            .collect();
        Ok(complete_snapshot(partitions, found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_core::{Fingerprint, PartitionState};

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog").join("catalog.json");
        let partition = PartitionRef::new("cleaned_flights", "2024-03-01");

        {
            let catalog = FileCatalog::open(&path).await.unwrap();
            catalog
                .record_state(
                    StateChange::new(partition.clone(), PartitionState::Succeeded)
                        .with_input_fingerprint(Fingerprint::from_hex("in"))
                        .with_commit(Fingerprint::from_hex("out"), 7),
                )
                .await
                .unwrap();
        }

        let reopened = FileCatalog::open(&path).await.unwrap();
        let record = reopened.get(&partition).await.unwrap().unwrap();
        assert_eq!(record.state, PartitionState::Succeeded);
        assert_eq!(record.output_fingerprint, Some(Fingerprint::from_hex("out")));
        assert_eq!(record.row_count, Some(7));
        assert!(record.last_success_at.is_some());
    }

    #[tokio::test]
    async fn test_open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FileCatalog::open(dir.path().join("nope.json")).await.unwrap();
        let page = catalog
            .list_page("raw_flights", &KeyRange::all(), None, 10)
            .await
            .unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, r#"{"version": 99, "partitions": []}"#).unwrap();

        let result = FileCatalog::open(&path).await;
        assert!(matches!(result, Err(Error::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let catalog = FileCatalog::open(&path).await.unwrap();
        catalog
            .record_state(StateChange::new(
                PartitionRef::new("raw_flights", "2024-03-01"),
                PartitionState::Pending,
            ))
            .await
            .unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");

        write_atomic(&path, b"[1]").await.unwrap();
        write_atomic(&path, b"[1,2]").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"[1,2]");
        assert!(!path.with_extension("json.tmp").exists());
    }
}
