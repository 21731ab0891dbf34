//! Builders for wiring an orchestrator against in-memory collaborators
//!
//! The harness keeps handles to the catalog, output store and fetcher so
//! tests can assert on persisted state after a run.

use chrono::NaiveDate;
use runway_core::{
    AssetSelection, KeyRange, PartitionRecord, PartitionRef, PartitionState, PipelineDefinition,
    StorageReader, StorageWriter,
};
use runway_runtime::{
    AssetCompute, BackfillRequest, Orchestrator, RetryPolicy, RunReport, WorkSet,
};
use runway_storage::{InMemoryCatalog, MemoryStore, PartitionCatalog};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::fixtures::dates;
use crate::mocks::StaticFetcher;

/// Builder for [`TestHarness`]
pub struct HarnessBuilder {
    definition: PipelineDefinition,
    fetcher: Arc<StaticFetcher>,
    catalog: Arc<InMemoryCatalog>,
    store: Arc<MemoryStore>,
    storage: Option<(Arc<dyn StorageWriter>, Arc<dyn StorageReader>)>,
    computes: Vec<(String, Arc<dyn AssetCompute>)>,
    retry: RetryPolicy,
    concurrency: Option<usize>,
    today: NaiveDate,
}

impl HarnessBuilder {
    pub fn new(definition: PipelineDefinition) -> Self {
        Self {
            definition,
            fetcher: Arc::new(StaticFetcher::new()),
            catalog: Arc::new(InMemoryCatalog::new()),
            store: Arc::new(MemoryStore::new()),
            storage: None,
            computes: Vec::new(),
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..RetryPolicy::default()
            },
            concurrency: None,
            today: dates::march(3),
        }
    }

    pub fn fetcher(mut self, fetcher: StaticFetcher) -> Self {
        self.fetcher = Arc::new(fetcher);
        self
    }

    /// Reuse a catalog, e.g. to simulate a second process run
    pub fn catalog(mut self, catalog: Arc<InMemoryCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = store;
        self
    }

    /// Route writes and reads through custom storage instead of the store
    pub fn storage(mut self, writer: Arc<dyn StorageWriter>, reader: Arc<dyn StorageReader>) -> Self {
        self.storage = Some((writer, reader));
        self
    }

    /// Replace one asset's declared compute
    pub fn compute(mut self, asset: &str, compute: Arc<dyn AssetCompute>) -> Self {
        self.computes.push((asset.to_string(), compute));
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Day treated as "today" when enumerating daily partitions
    pub fn today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn build(self) -> TestHarness {
        let mut definition = self.definition;
        if let Some(concurrency) = self.concurrency {
            definition.settings.concurrency = concurrency;
        }

        let (writer, reader) = match self.storage {
            Some(storage) => storage,
            None => (
                self.store.clone() as Arc<dyn StorageWriter>,
                self.store.clone() as Arc<dyn StorageReader>,
            ),
        };

        let mut builder = Orchestrator::builder(definition)
            .catalog(self.catalog.clone())
            .storage(writer, reader)
            .fetcher(self.fetcher.clone())
            .retry_policy(self.retry);
        for (asset, compute) in self.computes {
            builder = builder.compute(asset, compute);
        }
        let orchestrator = builder
            .build()
            .unwrap_or_else(|e| panic!("failed to build orchestrator: {}", e));

        TestHarness {
            orchestrator,
            catalog: self.catalog,
            store: self.store,
            fetcher: self.fetcher,
            today: self.today,
        }
    }
}

/// Orchestrator wired to an in-memory catalog, store and fetcher
pub struct TestHarness {
    pub orchestrator: Orchestrator,
    pub catalog: Arc<InMemoryCatalog>,
    pub store: Arc<MemoryStore>,
    pub fetcher: Arc<StaticFetcher>,
    pub today: NaiveDate,
}

impl TestHarness {
    pub fn builder(definition: PipelineDefinition) -> HarnessBuilder {
        HarnessBuilder::new(definition)
    }

    /// Materialize `select` over `partition` (`KEY`, `START..END` or `*`)
    pub async fn materialize(&self, select: &str, partition: &str) -> RunReport {
        self.materialize_with(select, partition, CancellationToken::new())
            .await
    }

    pub async fn materialize_with(
        &self,
        select: &str,
        partition: &str,
        cancel: CancellationToken,
    ) -> RunReport {
        let selection = selection(select);
        let range = range(partition);
        self.orchestrator
            .materialize(&selection, &range, self.today, cancel)
            .await
            .unwrap_or_else(|e| panic!("materialize {} failed: {}", select, e))
    }

    /// Partitions that would be materialized, without running them
    pub async fn stale(&self, select: &str, partition: &str) -> WorkSet {
        self.orchestrator
            .resolve(&selection(select), &range(partition), self.today)
            .await
            .unwrap_or_else(|e| panic!("resolve {} failed: {}", select, e))
    }

    /// Backfill request anchored at the harness's today
    pub fn backfill_request(&self, select: &str, from: &str, to: &str) -> BackfillRequest {
        BackfillRequest::new(selection(select), KeyRange::between(from, to), self.today)
    }

    pub async fn backfill(&self, request: &BackfillRequest) -> RunReport {
        self.orchestrator
            .backfill(request, CancellationToken::new())
            .await
            .unwrap_or_else(|e| panic!("backfill failed: {}", e))
    }

    /// Stored record, or a `missing` record when never recorded
    pub async fn record(&self, asset: &str, key: &str) -> PartitionRecord {
        self.catalog
            .get(&PartitionRef::new(asset, key))
            .await
            .unwrap_or_else(|e| panic!("catalog read failed: {}", e))
            .unwrap_or_else(|| PartitionRecord::missing(asset, key))
    }

    pub async fn state(&self, asset: &str, key: &str) -> PartitionState {
        self.record(asset, key).await.state
    }
}

fn selection(select: &str) -> AssetSelection {
    AssetSelection::parse(select).unwrap_or_else(|e| panic!("bad selection {}: {}", select, e))
}

fn range(partition: &str) -> KeyRange {
    if partition == "*" {
        return KeyRange::all();
    }
    KeyRange::parse(partition).unwrap_or_else(|e| panic!("bad range {}: {}", partition, e))
}
