//! Backfill and rerun planning
//!
//! The controller turns a selection and key range into a work set. In
//! `missing_only` mode it defers to the staleness resolver (manual assets
//! included). In `force_all` mode it invalidates the selected partitions and,
//! unless propagation is disabled, every partition downstream of them.
//! Invalidation resets the stored input fingerprint to `unknown` and keeps
//! the recorded state, so a partition the run never reaches is still stale
//! afterwards but not left `pending`. Stored rows are left alone.

use chrono::NaiveDate;
use runway_core::{AssetGraph, AssetSelection, Fingerprint, KeyRange, PartitionRef};
use runway_storage::{PartitionCatalog, StateChange};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::concurrency::PartitionLocks;
use crate::resolver::{
    scoped_range, ResolveRequest, StaleReason, StalenessResolver, WorkItem, WorkSet,
};
use crate::{Error, Result};

/// Default maximum partitions per asset in one backfill
pub const DEFAULT_BACKFILL_LIMIT: usize = 366;

/// Which partitions a backfill recomputes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackfillMode {
    /// Only partitions the staleness resolver considers stale
    #[default]
    MissingOnly,

    /// Every selected partition, regardless of state
    ForceAll,
}

impl BackfillMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillMode::MissingOnly => "missing_only",
            BackfillMode::ForceAll => "force_all",
        }
    }
}

impl fmt::Display for BackfillMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackfillMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "missing_only" => Ok(BackfillMode::MissingOnly),
            "force_all" => Ok(BackfillMode::ForceAll),
            other => Err(format!("Unknown backfill mode: {}", other)),
        }
    }
}

/// A backfill to plan
#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub selection: AssetSelection,
    pub range: KeyRange,
    pub mode: BackfillMode,
    /// Expand forced invalidation to downstream partitions
    pub propagate: bool,
    pub today: NaiveDate,
}

impl BackfillRequest {
    pub fn new(selection: AssetSelection, range: KeyRange, today: NaiveDate) -> Self {
        Self {
            selection,
            range,
            mode: BackfillMode::MissingOnly,
            propagate: true,
            today,
        }
    }

    pub fn force(mut self) -> Self {
        self.mode = BackfillMode::ForceAll;
        self
    }

    pub fn without_propagation(mut self) -> Self {
        self.propagate = false;
        self
    }
}

/// Plans backfills and reruns
#[derive(Clone)]
pub struct BackfillController {
    graph: Arc<AssetGraph>,
    catalog: Arc<dyn PartitionCatalog>,
    resolver: StalenessResolver,
    locks: PartitionLocks,
    limit: usize,
}

impl BackfillController {
    pub fn new(graph: Arc<AssetGraph>, catalog: Arc<dyn PartitionCatalog>) -> Self {
        Self {
            resolver: StalenessResolver::new(graph.clone(), catalog.clone()),
            graph,
            catalog,
            locks: PartitionLocks::new(),
            limit: DEFAULT_BACKFILL_LIMIT,
        }
    }

    /// Maximum partitions per asset; larger plans are rejected
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Serialize invalidation with the schedulers sharing these locks
    pub fn with_partition_locks(mut self, locks: PartitionLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Build the work set for `request`.
    ///
    /// In `force_all` mode the plan is fully computed and checked against the
    /// limit before any partition is invalidated.
    #[instrument(
        name = "backfill.plan",
        skip(self, request),
        fields(
            selection = %request.selection,
            range = %request.range,
            mode = %request.mode,
            propagate = request.propagate,
        )
    )]
    pub async fn plan(&self, request: &BackfillRequest) -> Result<WorkSet> {
        let assets = request.selection.resolve(&self.graph)?;
        let range = scoped_range(&self.graph, &assets, &request.range)?;

        let work = match request.mode {
            BackfillMode::MissingOnly => {
                let work = self
                    .resolver
                    .resolve(&ResolveRequest {
                        assets,
                        range,
                        include_manual: true,
                        today: request.today,
                    })
                    .await?;
                self.check_limit(&work)?;
                work
            }
            BackfillMode::ForceAll => {
                let work = self.forced_plan(&assets, &range, request)?;
                self.check_limit(&work)?;
                self.invalidate(&work).await?;
                work
            }
        };

        info!(partitions = work.len(), "Backfill planned");
        Ok(work)
    }

    fn forced_plan(
        &self,
        assets: &BTreeSet<String>,
        range: &KeyRange,
        request: &BackfillRequest,
    ) -> Result<WorkSet> {
        let mut planned: BTreeMap<PartitionRef, StaleReason> = BTreeMap::new();
        let mut queue = VecDeque::new();

        for asset in assets {
            let node = self.graph.node(asset)?;
            for key in node.partitions.keys_in_range(range, request.today) {
                let partition = PartitionRef::new(asset.clone(), key);
                planned.insert(partition.clone(), StaleReason::Invalidated);
                queue.push_back(partition);
            }
        }

        if request.propagate {
            while let Some(partition) = queue.pop_front() {
                for dependent in self.graph.downstream_partitions(
                    &partition.asset,
                    &partition.key,
                    request.today,
                )? {
                    if !planned.contains_key(&dependent) {
                        debug!(partition = %dependent, upstream = %partition, "Propagating invalidation");
                        planned.insert(
                            dependent.clone(),
                            StaleReason::UpstreamInvalidated(partition.clone()),
                        );
                        queue.push_back(dependent);
                    }
                }
            }
        }

        Ok(WorkSet::ordered(
            &self.graph,
            planned
                .into_iter()
                .map(|(partition, reason)| WorkItem { partition, reason }),
        ))
    }

    fn check_limit(&self, work: &WorkSet) -> Result<()> {
        if let Some((asset, count)) = work
            .counts_by_asset()
            .into_iter()
            .find(|(_, count)| *count > self.limit)
        {
            return Err(Error::BackfillTooLarge {
                asset: asset.to_string(),
                count,
                limit: self.limit,
            });
        }
        Ok(())
    }

    async fn invalidate(&self, work: &WorkSet) -> Result<()> {
        let mut invalidated = 0;
        for partition in work.partitions() {
            let _guard = self.locks.lock(partition).await;
            // Never recorded: already unknown
            let Some(record) = self.catalog.get(partition).await? else {
                continue;
            };
            let mut change = StateChange::new(partition.clone(), record.state)
                .with_input_fingerprint(Fingerprint::unknown());
            if let Some(upstream) = record.blocked_by {
                change = change.blocked_by(upstream);
            }
            self.catalog.record_state(change).await?;
            invalidated += 1;
        }
        info!(planned = work.len(), invalidated, "Partitions invalidated");
        Ok(())
    }
}

/// Daily keys from `start` to `end` inclusive, as a key range
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Result<KeyRange> {
    let range = KeyRange::between(start, end);
    range.validate()?;
    Ok(range)
}
