//! In-memory partition catalog, used by tests and dry runs

use async_trait::async_trait;
use chrono::Utc;
use runway_core::{KeyRange, PartitionKey, PartitionRecord, PartitionRef};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::debug;

use crate::catalog::{complete_snapshot, PartitionCatalog, StateChange};
use crate::metrics;
use crate::{Error, Result};

/// Catalog held entirely in process memory.
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    records: Arc<RwLock<BTreeMap<PartitionRef, PartitionRecord>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the catalog with existing records
    pub fn with_records(records: impl IntoIterator<Item = PartitionRecord>) -> Self {
        let map = records
            .into_iter()
            .map(|record| (record.partition_ref(), record))
            .collect();
        Self {
            records: Arc::new(RwLock::new(map)),
        }
    }

    /// Number of recorded partitions
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PartitionCatalog for InMemoryCatalog {
    async fn record_state(&self, change: StateChange) -> Result<PartitionRecord> {
        let started = Instant::now();
        let mut records = self.records.write().map_err(|_| Error::LockPoisoned)?;
        let current = records.get(&change.partition).cloned();
        let record = change.apply(current, Utc::now());
        records.insert(change.partition.clone(), record.clone());

        debug!(
            partition = %change.partition,
            state = %record.state,
            "Recorded partition state"
        );
        metrics::record_write("memory", record.state.as_str());
        metrics::observe("memory", "record_state", started);
        Ok(record)
    }

    async fn get(&self, partition: &PartitionRef) -> Result<Option<PartitionRecord>> {
        let records = self.records.read().map_err(|_| Error::LockPoisoned)?;
        Ok(records.get(partition).cloned())
    }

    async fn list_page(
        &self,
        asset: &str,
        range: &KeyRange,
        after: Option<&PartitionKey>,
        limit: usize,
    ) -> Result<Vec<PartitionRecord>> {
        let records = self.records.read().map_err(|_| Error::LockPoisoned)?;
        Ok(page_from_map(&records, asset, range, after, limit))
    }

    async fn snapshot(
        &self,
        partitions: &[PartitionRef],
    ) -> Result<BTreeMap<PartitionRef, PartitionRecord>> {
        let records = self.records.read().map_err(|_| Error::LockPoisoned)?;
        let found = partitions
            .iter()
            .filter_map(|p| records.get(p).map(|r| (p.clone(), r.clone())))
            .collect();
        Ok(complete_snapshot(partitions, found))
    }
}

/// Keyset page over an ordered map of records
pub(crate) fn page_from_map(
    records: &BTreeMap<PartitionRef, PartitionRecord>,
    asset: &str,
    range: &KeyRange,
    after: Option<&PartitionKey>,
    limit: usize,
) -> Vec<PartitionRecord> {
    records
        .iter()
        .filter(|(p, _)| p.asset == asset)
        .filter(|(p, _)| after.map_or(true, |after| &p.key > after))
        .filter(|(p, _)| range.contains(&p.key))
        .take(limit)
        .map(|(_, record)| record.clone())
        .collect()
}
