//! Partition catalog contract
//!
//! The catalog tracks the materialization state of every known partition. It
//! has exactly one write path, [`PartitionCatalog::record_state`], which is
//! atomic per (asset, key). Reads never observe a half-applied change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use runway_core::{
    DataQualityResult, Fingerprint, KeyRange, PartitionKey, PartitionRecord, PartitionRef,
    PartitionState,
};
use std::collections::{BTreeMap, VecDeque};

use crate::Result;

/// Records fetched per page by [`PartitionCatalog::list_partitions`]
pub const LIST_PAGE_SIZE: usize = 256;

/// A single state transition for one partition.
///
/// Optional fields left as `None` keep the stored value. `blocked_by` is
/// always overwritten so that a successful run clears a previous block.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub partition: PartitionRef,
    pub state: PartitionState,
    pub input_fingerprint: Option<Fingerprint>,
    pub output_fingerprint: Option<Fingerprint>,
    pub row_count: Option<u64>,
    pub quality_results: Option<Vec<DataQualityResult>>,
    pub blocked_by: Option<PartitionRef>,
}

impl StateChange {
    pub fn new(partition: PartitionRef, state: PartitionState) -> Self {
        Self {
            partition,
            state,
            input_fingerprint: None,
            output_fingerprint: None,
            row_count: None,
            quality_results: None,
            blocked_by: None,
        }
    }

    pub fn with_input_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.input_fingerprint = Some(fingerprint);
        self
    }

    /// Attach the commit returned by the storage writer
    pub fn with_commit(mut self, output: Fingerprint, row_count: u64) -> Self {
        self.output_fingerprint = Some(output);
        self.row_count = Some(row_count);
        self
    }

    pub fn with_quality_results(mut self, results: Vec<DataQualityResult>) -> Self {
        self.quality_results = Some(results);
        self
    }

    pub fn blocked_by(mut self, upstream: PartitionRef) -> Self {
        self.blocked_by = Some(upstream);
        self
    }

    /// Apply the change to the current record
    pub fn apply(&self, current: Option<PartitionRecord>, now: DateTime<Utc>) -> PartitionRecord {
        let mut record = current.unwrap_or_else(|| {
            PartitionRecord::missing(
                self.partition.asset.clone(),
                self.partition.key.clone(),
            )
        });

        record.state = self.state;
        if let Some(fingerprint) = &self.input_fingerprint {
            record.input_fingerprint = fingerprint.clone();
        }
        if let Some(output) = &self.output_fingerprint {
            record.output_fingerprint = Some(output.clone());
        }
        if let Some(rows) = self.row_count {
            record.row_count = Some(rows);
        }
        if let Some(results) = &self.quality_results {
            record.quality_results = results.clone();
        }
        record.blocked_by = self.blocked_by.clone();
        if self.state == PartitionState::Succeeded {
            record.last_success_at = Some(now);
        }
        record.updated_at = now;
        record
    }
}

/// Persistent record of partition states
#[async_trait]
pub trait PartitionCatalog: Send + Sync {
    /// Apply one state change atomically and return the resulting record
    async fn record_state(&self, change: StateChange) -> Result<PartitionRecord>;

    /// Stored record, if the partition was ever recorded
    async fn get(&self, partition: &PartitionRef) -> Result<Option<PartitionRecord>>;

    /// One page of `asset`'s records in `range`, keys ascending and strictly
    /// after `after`
    async fn list_page(
        &self,
        asset: &str,
        range: &KeyRange,
        after: Option<&PartitionKey>,
        limit: usize,
    ) -> Result<Vec<PartitionRecord>>;

    /// Consistent view of `partitions`; unknown partitions come back as `missing`
    async fn snapshot(
        &self,
        partitions: &[PartitionRef],
    ) -> Result<BTreeMap<PartitionRef, PartitionRecord>>;

    /// Stored input fingerprint, or the `unknown` sentinel
    async fn fingerprint_of(&self, partition: &PartitionRef) -> Result<Fingerprint> {
        Ok(self
            .get(partition)
            .await?
            .map(|record| record.input_fingerprint)
            .unwrap_or_else(Fingerprint::unknown))
    }

    /// Lazily stream `asset`'s recorded partitions in `range`, keys ascending.
    ///
    /// Pages are fetched on demand with a keyset cursor, so the stream is
    /// finite and calling this again restarts from the beginning.
    fn list_partitions<'a>(
        &'a self,
        asset: &'a str,
        range: KeyRange,
    ) -> BoxStream<'a, Result<PartitionRecord>> {
        let cursor = PageCursor {
            range,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::unfold(cursor, move |mut cursor| async move {
            loop {
                if let Some(record) = cursor.buffer.pop_front() {
                    return Some((Ok(record), cursor));
                }
                if cursor.exhausted {
                    return None;
                }
                match self
                    .list_page(asset, &cursor.range, cursor.after.as_ref(), LIST_PAGE_SIZE)
                    .await
                {
                    Ok(page) => {
                        cursor.exhausted = page.len() < LIST_PAGE_SIZE;
                        match page.last() {
                            Some(last) => cursor.after = Some(last.key.clone()),
                            None => return None,
                        }
                        cursor.buffer.extend(page);
                    }
                    Err(e) => {
                        cursor.exhausted = true;
                        return Some((Err(e), cursor));
                    }
                }
            }
        })
        .boxed()
    }
}

struct PageCursor {
    range: KeyRange,
    after: Option<PartitionKey>,
    buffer: VecDeque<PartitionRecord>,
    exhausted: bool,
}

/// Fill gaps in a snapshot with `missing` records
pub(crate) fn complete_snapshot(
    partitions: &[PartitionRef],
    mut found: BTreeMap<PartitionRef, PartitionRecord>,
) -> BTreeMap<PartitionRef, PartitionRecord> {
    for partition in partitions {
        found.entry(partition.clone()).or_insert_with(|| {
            PartitionRecord::missing(partition.asset.clone(), partition.key.clone())
        });
    }
    found
}
