//! Orchestrator wiring the resolver, scheduler and backfill controller
//!
//! The orchestrator owns nothing global: the graph, catalog and storage are
//! `Arc`s handed in at construction and shared with every component.
//!
//! # Example
//!
//! ```no_run
//! use runway_core::{AssetSelection, KeyRange, PipelineConfig};
//! use runway_runtime::Orchestrator;
//! use runway_storage::{InMemoryCatalog, MemoryStore};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(fetcher: Arc<dyn runway_core::SourceFetcher>) -> Result<(), Box<dyn std::error::Error>> {
//! let definition = PipelineConfig::from_path("runway.yaml")?.build()?;
//! let store = Arc::new(MemoryStore::new());
//!
//! let orchestrator = Orchestrator::builder(definition)
//!     .catalog(Arc::new(InMemoryCatalog::new()))
//!     .storage(store.clone(), store)
//!     .fetcher(fetcher)
//!     .build()?;
//!
//! let today = chrono::Utc::now().date_naive();
//! let report = orchestrator
//!     .materialize(&AssetSelection::all(), &KeyRange::all(), today, CancellationToken::new())
//!     .await?;
//! std::process::exit(report.exit_code());
//! # }
//! ```

use chrono::NaiveDate;
use runway_core::{
    AssetGraph, AssetSelection, KeyRange, PipelineDefinition, QualityCheck, Settings,
    SourceFetcher, StorageReader, StorageWriter,
};
use runway_storage::PartitionCatalog;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::backfill::{BackfillController, BackfillRequest};
use crate::compute::ComputeRegistry;
use crate::concurrency::PartitionLocks;
use crate::quality_gate::CheckRunner;
use crate::report::RunReport;
use crate::resolver::{ResolveRequest, StalenessResolver, WorkSet};
use crate::retry::RetryPolicy;
use crate::scheduler::MaterializationScheduler;
use crate::unit::AssetCompute;
use crate::{Error, Result};

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    definition: PipelineDefinition,
    catalog: Option<Arc<dyn PartitionCatalog>>,
    writer: Option<Arc<dyn StorageWriter>>,
    reader: Option<Arc<dyn StorageReader>>,
    fetcher: Option<Arc<dyn SourceFetcher>>,
    overrides: Vec<(String, Arc<dyn AssetCompute>)>,
    check_runner: Option<Arc<dyn CheckRunner>>,
    retry: Option<RetryPolicy>,
    locks: PartitionLocks,
}

impl OrchestratorBuilder {
    pub fn catalog(mut self, catalog: Arc<dyn PartitionCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Output store used for writes and for reading upstream inputs
    pub fn storage(mut self, writer: Arc<dyn StorageWriter>, reader: Arc<dyn StorageReader>) -> Self {
        self.writer = Some(writer);
        self.reader = Some(reader);
        self
    }

    /// Fetcher backing every `source` compute
    pub fn fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Replace the declared compute of one asset
    pub fn compute(mut self, asset: impl Into<String>, compute: Arc<dyn AssetCompute>) -> Self {
        self.overrides.push((asset.into(), compute));
        self
    }

    pub fn check_runner(mut self, runner: Arc<dyn CheckRunner>) -> Self {
        self.check_runner = Some(runner);
        self
    }

    /// Override the retry policy from the pipeline settings
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn partition_locks(mut self, locks: PartitionLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let catalog = self
            .catalog
            .ok_or_else(|| Error::Config("a partition catalog is required".to_string()))?;
        let writer = self
            .writer
            .ok_or_else(|| Error::Config("a storage writer is required".to_string()))?;
        let reader = self
            .reader
            .ok_or_else(|| Error::Config("a storage reader is required".to_string()))?;

        let definition = self.definition;
        let mut computes = match self.fetcher {
            Some(fetcher) => ComputeRegistry::from_definition(&definition, fetcher),
            None => ComputeRegistry::new(),
        };
        for (asset, compute) in self.overrides {
            if !definition.graph.contains(&asset) {
                return Err(Error::Graph(runway_core::GraphError::UnknownAsset(asset)));
            }
            computes.insert(asset, compute);
        }

        let checks: BTreeMap<String, Vec<QualityCheck>> = definition
            .graph
            .assets()
            .iter()
            .map(|node| (node.name.clone(), definition.checks_for(&node.name)))
            .collect();

        let settings = definition.settings.clone();
        let graph = Arc::new(definition.graph);

        let mut scheduler = MaterializationScheduler::builder(
            graph.clone(),
            catalog.clone(),
            writer,
            reader,
        )
        .computes(computes)
        .checks(checks)
        .retry_policy(
            self.retry
                .unwrap_or_else(|| RetryPolicy::from(&settings.retry)),
        )
        .concurrency(settings.concurrency)
        .resource_limits(settings.resource_limits.clone())
        .partition_locks(self.locks.clone());
        if let Some(runner) = self.check_runner {
            scheduler = scheduler.check_runner(runner);
        }

        Ok(Orchestrator {
            resolver: StalenessResolver::new(graph.clone(), catalog.clone()),
            backfill: BackfillController::new(graph.clone(), catalog.clone())
                .with_limit(settings.backfill_limit)
                .with_partition_locks(self.locks),
            scheduler: scheduler.build()?,
            graph,
            catalog,
            settings,
        })
    }
}

/// Entry point for materialize and backfill runs
#[derive(Clone)]
pub struct Orchestrator {
    graph: Arc<AssetGraph>,
    catalog: Arc<dyn PartitionCatalog>,
    settings: Settings,
    resolver: StalenessResolver,
    scheduler: MaterializationScheduler,
    backfill: BackfillController,
}

impl Orchestrator {
    pub fn builder(definition: PipelineDefinition) -> OrchestratorBuilder {
        OrchestratorBuilder {
            definition,
            catalog: None,
            writer: None,
            reader: None,
            fetcher: None,
            overrides: Vec::new(),
            check_runner: None,
            retry: None,
            locks: PartitionLocks::new(),
        }
    }

    pub fn graph(&self) -> &Arc<AssetGraph> {
        &self.graph
    }

    pub fn catalog(&self) -> &Arc<dyn PartitionCatalog> {
        &self.catalog
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn scheduler(&self) -> &MaterializationScheduler {
        &self.scheduler
    }

    /// Stale partitions for `selection` without running anything
    pub async fn resolve(
        &self,
        selection: &AssetSelection,
        range: &KeyRange,
        today: NaiveDate,
    ) -> Result<WorkSet> {
        let assets = selection.resolve(&self.graph)?;
        self.resolver
            .resolve(&ResolveRequest {
                assets,
                range: range.clone(),
                include_manual: false,
                today,
            })
            .await
    }

    /// Bring the selected partitions up to date
    #[instrument(
        name = "orchestrator.materialize",
        skip(self, selection, range, cancel),
        fields(selection = %selection, range = %range)
    )]
    pub async fn materialize(
        &self,
        selection: &AssetSelection,
        range: &KeyRange,
        today: NaiveDate,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let work = self.resolve(selection, range, today).await?;
        info!(partitions = work.len(), "Materializing stale partitions");
        self.scheduler.run(work, today, cancel).await
    }

    /// Plan and run a backfill
    #[instrument(name = "orchestrator.backfill", skip(self, request, cancel))]
    pub async fn backfill(
        &self,
        request: &BackfillRequest,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let work = self.backfill.plan(request).await?;
        self.scheduler.run(work, request.today, cancel).await
    }

    /// Plan a backfill without running it; forced plans still invalidate
    pub async fn plan_backfill(&self, request: &BackfillRequest) -> Result<WorkSet> {
        self.backfill.plan(request).await
    }
}
