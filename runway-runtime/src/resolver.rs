//! Staleness resolution
//!
//! Decides which partitions need recomputation by comparing each partition's
//! stored input fingerprint with the fingerprint of its upstreams' current
//! contributions. The result is a [`WorkSet`] ordered topologically and then
//! by key.

use chrono::NaiveDate;
use runway_core::{
    AssetGraph, Fingerprint, KeyRange, PartitionDimension, PartitionRecord, PartitionRef,
    PartitionState, StalenessPolicy,
};
use runway_storage::PartitionCatalog;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::Result;

/// Why a partition was put into a work set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// Never materialized
    Missing,

    /// The last run failed
    Failed,

    /// A previous run stopped while the partition was pending or in progress
    Interrupted(PartitionState),

    /// Upstream contributions changed since the last run
    FingerprintChanged {
        stored: Fingerprint,
        expected: Fingerprint,
    },

    /// An eager asset whose upstream is recomputed in the same run
    UpstreamInWorkSet(PartitionRef),

    /// Explicitly invalidated by a forced backfill
    Invalidated,

    /// Dependent of an invalidated partition
    UpstreamInvalidated(PartitionRef),
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::Missing => write!(f, "missing"),
            StaleReason::Failed => write!(f, "failed"),
            StaleReason::Interrupted(state) => write!(f, "interrupted while {}", state),
            StaleReason::FingerprintChanged { .. } => write!(f, "inputs changed"),
            StaleReason::UpstreamInWorkSet(upstream) => write!(f, "upstream {} recomputed", upstream),
            StaleReason::Invalidated => write!(f, "invalidated"),
            StaleReason::UpstreamInvalidated(upstream) => {
                write!(f, "upstream {} invalidated", upstream)
            }
        }
    }
}

/// One partition to materialize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub partition: PartitionRef,
    pub reason: StaleReason,
}

/// Partitions selected for a run, in dispatch order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkSet {
    items: Vec<WorkItem>,
}

impl WorkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from unordered items, sorting by the graph's topological order
    /// and then by key
    pub fn ordered(graph: &AssetGraph, items: impl IntoIterator<Item = WorkItem>) -> Self {
        let rank: HashMap<String, usize> = graph
            .topological_order()
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, i))
            .collect();

        let mut items: Vec<WorkItem> = items.into_iter().collect();
        items.sort_by(|a, b| {
            let ra = rank.get(&a.partition.asset).copied().unwrap_or(usize::MAX);
            let rb = rank.get(&b.partition.asset).copied().unwrap_or(usize::MAX);
            ra.cmp(&rb)
                .then_with(|| a.partition.asset.cmp(&b.partition.asset))
                .then_with(|| a.partition.key.cmp(&b.partition.key))
        });
        items.dedup_by(|a, b| a.partition == b.partition);
        Self { items }
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, partition: &PartitionRef) -> bool {
        self.items.iter().any(|item| &item.partition == partition)
    }

    pub fn partitions(&self) -> impl Iterator<Item = &PartitionRef> {
        self.items.iter().map(|item| &item.partition)
    }

    /// Number of partitions per asset
    pub fn counts_by_asset(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.items {
            *counts.entry(item.partition.asset.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

impl IntoIterator for WorkSet {
    type Item = WorkItem;
    type IntoIter = std::vec::IntoIter<WorkItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// What to resolve
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    /// Assets to consider; others are treated as outside the run
    pub assets: BTreeSet<String>,
    pub range: KeyRange,
    /// Consider `manual` assets too (backfills only)
    pub include_manual: bool,
    /// Upper bound for daily key enumeration
    pub today: NaiveDate,
}

/// Computes the work set for a selection
#[derive(Clone)]
pub struct StalenessResolver {
    graph: Arc<AssetGraph>,
    catalog: Arc<dyn PartitionCatalog>,
}

impl StalenessResolver {
    pub fn new(graph: Arc<AssetGraph>, catalog: Arc<dyn PartitionCatalog>) -> Self {
        Self { graph, catalog }
    }

    #[instrument(
        name = "resolver.resolve",
        skip(self, request),
        fields(assets = request.assets.len(), range = %request.range, stale = tracing::field::Empty)
    )]
    pub async fn resolve(&self, request: &ResolveRequest) -> Result<WorkSet> {
        let range = scoped_range(&self.graph, &request.assets, &request.range)?;
        let mut planned: BTreeSet<PartitionRef> = BTreeSet::new();
        let mut items = Vec::new();

        for asset in self.graph.topological_order() {
            if !request.assets.contains(&asset) {
                continue;
            }
            let node = self.graph.node(&asset)?;
            if node.policy == StalenessPolicy::Manual && !request.include_manual {
                debug!(asset = %asset, "Skipping manual asset");
                continue;
            }

            let keys = node.partitions.keys_in_range(&range, request.today);
            if keys.is_empty() {
                continue;
            }

            let mut upstreams_by_key = Vec::with_capacity(keys.len());
            let mut refs = Vec::new();
            for key in keys {
                let own = PartitionRef::new(asset.clone(), key.clone());
                let upstreams = self.graph.upstream_partitions(&asset, &key, request.today)?;
                refs.push(own.clone());
                refs.extend(upstreams.iter().cloned());
                upstreams_by_key.push((own, upstreams));
            }
            refs.sort();
            refs.dedup();

            let snapshot = self.catalog.snapshot(&refs).await?;

            for (own, upstreams) in upstreams_by_key {
                let Some(record) = snapshot.get(&own) else {
                    continue;
                };
                let reason = stale_reason(record, &upstreams, &snapshot).or_else(|| {
                    if node.policy != StalenessPolicy::Eager {
                        return None;
                    }
                    upstreams
                        .iter()
                        .find(|upstream| planned.contains(*upstream))
                        .map(|upstream| StaleReason::UpstreamInWorkSet(upstream.clone()))
                });

                if let Some(reason) = reason {
                    debug!(partition = %own, reason = %reason, "Partition is stale");
                    planned.insert(own.clone());
                    items.push(WorkItem {
                        partition: own,
                        reason,
                    });
                }
            }
        }

        let work = WorkSet::ordered(&self.graph, items);
        tracing::Span::current().record("stale", work.len());
        info!(stale = work.len(), "Staleness resolved");
        Ok(work)
    }
}

/// `range` as it applies to `assets`.
///
/// When every partitioned asset in the selection is daily the bounds must be
/// dates and are rewritten in the key format. Selections with custom keys
/// compare bounds as plain keys.
pub fn scoped_range(
    graph: &AssetGraph,
    assets: &BTreeSet<String>,
    range: &KeyRange,
) -> Result<KeyRange> {
    let mut daily = false;
    for asset in assets {
        match graph.node(asset)?.partitions {
            PartitionDimension::Daily { .. } => daily = true,
            PartitionDimension::Custom { .. } => return Ok(range.clone()),
            PartitionDimension::None => {}
        }
    }
    if daily {
        return Ok(range.to_daily()?);
    }
    Ok(range.clone())
}

/// Input fingerprint a partition would get if computed from `snapshot` now
pub fn expected_fingerprint(
    upstreams: &[PartitionRef],
    snapshot: &BTreeMap<PartitionRef, PartitionRecord>,
) -> Fingerprint {
    Fingerprint::of_inputs(upstreams.iter().map(|upstream| {
        let contribution = snapshot
            .get(upstream)
            .map(PartitionRecord::contribution)
            .unwrap_or_else(|| format!("state:{}", PartitionState::Missing.as_str()));
        (upstream, contribution)
    }))
}

fn stale_reason(
    record: &PartitionRecord,
    upstreams: &[PartitionRef],
    snapshot: &BTreeMap<PartitionRef, PartitionRecord>,
) -> Option<StaleReason> {
    match record.state {
        PartitionState::Missing => Some(StaleReason::Missing),
        PartitionState::Failed => Some(StaleReason::Failed),
        PartitionState::Pending | PartitionState::InProgress => {
            Some(StaleReason::Interrupted(record.state))
        }
        PartitionState::Succeeded | PartitionState::Quarantined => {
            let expected = expected_fingerprint(upstreams, snapshot);
            (expected != record.input_fingerprint).then(|| StaleReason::FingerprintChanged {
                stored: record.input_fingerprint.clone(),
                expected,
            })
        }
    }
}
