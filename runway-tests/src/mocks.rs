//! Mock implementations of the engine's collaborators
//!
//! Provides in-process sources, computes and writers with failure injection,
//! so scheduler behavior can be exercised without external systems.

use async_trait::async_trait;
use runway_core::{
    FetchError, Fingerprint, PartitionKey, PartitionRef, ReadError, Row, SourceFetcher,
    StorageReader, StorageWriter, Watermark, WriteError,
};
use runway_runtime::{AssetCompute, ComputeContext, UnitError};
use runway_storage::MemoryStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source fetcher serving fixed rows per source id
///
/// # Example
///
/// ```ignore
/// let fetcher = StaticFetcher::new()
///     .with_source("flights", fixtures::rows::flights_for_days(&[1, 2]))
///     .fail_transiently("flights", 2);
/// ```
#[derive(Default)]
pub struct StaticFetcher {
    sources: Mutex<HashMap<String, Vec<Row>>>,
    transient_failures: Mutex<HashMap<String, u32>>,
    permanent_failures: Mutex<HashMap<String, String>>,
    calls: AtomicU32,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `rows` for `source_id`
    pub fn with_source(self, source_id: &str, rows: Vec<Row>) -> Self {
        self.set_source(source_id, rows);
        self
    }

    /// Fail the next `times` fetches of `source_id` with a transient error
    pub fn fail_transiently(self, source_id: &str, times: u32) -> Self {
        lock(&self.transient_failures).insert(source_id.to_string(), times);
        self
    }

    /// Fail every fetch of `source_id` with a permanent error
    pub fn fail_permanently(self, source_id: &str, message: &str) -> Self {
        lock(&self.permanent_failures).insert(source_id.to_string(), message.to_string());
        self
    }

    /// Start failing `source_id` permanently from the next fetch on
    pub fn set_permanent_failure(&self, source_id: &str, message: &str) {
        lock(&self.permanent_failures).insert(source_id.to_string(), message.to_string());
    }

    /// Replace the rows served for `source_id`
    pub fn set_source(&self, source_id: &str, rows: Vec<Row>) {
        lock(&self.sources).insert(source_id.to_string(), rows);
    }

    /// Total fetch calls, including failed ones
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(&self, source_id: &str, _watermark: &Watermark) -> Result<Vec<Row>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = lock(&self.permanent_failures).get(source_id) {
            return Err(FetchError::Permanent(message.clone()));
        }
        if let Some(remaining) = lock(&self.transient_failures).get_mut(source_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::Transient(format!("{} timed out", source_id)));
            }
        }

        lock(&self.sources)
            .get(source_id)
            .cloned()
            .ok_or_else(|| FetchError::Permanent(format!("unknown source '{}'", source_id)))
    }
}

/// How a scripted compute misbehaves for one partition key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// Fail every attempt with a non-retryable error
    Permanent,
    /// Fail the first `n` attempts with a retryable error
    Transient(u32),
    /// Panic inside the compute
    Panic,
}

/// Shared record of compute invocations across every scripted compute
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<PartitionRef>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Partitions in the order their computes were entered
    pub fn calls(&self) -> Vec<PartitionRef> {
        lock(&self.calls).clone()
    }

    /// Calls made for one asset
    pub fn calls_for(&self, asset: &str) -> usize {
        lock(&self.calls).iter().filter(|p| p.asset == asset).count()
    }

    /// Highest number of computes running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self, partition: &PartitionRef) -> InFlight<'_> {
        lock(&self.calls).push(partition.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }
}

struct InFlight<'a>(&'a CallLog);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Compute wrapping another compute (or a fixed row) with failure injection,
/// an artificial delay and a shared call log
pub struct ScriptedCompute {
    inner: Option<Arc<dyn AssetCompute>>,
    reads_upstreams: bool,
    failures: HashMap<String, Failure>,
    attempts: Mutex<HashMap<String, u32>>,
    delay: Duration,
    log: CallLog,
}

impl ScriptedCompute {
    /// Emit one row per partition: its key and the number of upstream rows
    pub fn new(log: CallLog) -> Self {
        Self {
            inner: None,
            reads_upstreams: true,
            failures: HashMap::new(),
            attempts: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            log,
        }
    }

    /// Delegate successful attempts to `inner`
    pub fn wrapping(inner: Arc<dyn AssetCompute>, log: CallLog) -> Self {
        Self {
            reads_upstreams: inner.reads_upstreams(),
            inner: Some(inner),
            ..Self::new(log)
        }
    }

    /// Misbehave for one partition key
    pub fn failing_on(mut self, key: &str, failure: Failure) -> Self {
        self.failures.insert(key.to_string(), failure);
        self
    }

    /// Sleep this long inside every attempt
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn into_arc(self) -> Arc<dyn AssetCompute> {
        Arc::new(self)
    }

    fn next_attempt(&self, key: &str) -> u32 {
        let mut attempts = lock(&self.attempts);
        let attempt = attempts.entry(key.to_string()).or_insert(0);
        *attempt += 1;
        *attempt
    }
}

#[async_trait]
impl AssetCompute for ScriptedCompute {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    fn reads_upstreams(&self) -> bool {
        self.reads_upstreams
    }

    async fn compute(&self, ctx: &ComputeContext) -> Result<Vec<Row>, UnitError> {
        let _in_flight = self.log.enter(&ctx.partition);
        let key = ctx.partition.key.as_str();
        let attempt = self.next_attempt(key);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.failures.get(key) {
            Some(Failure::Permanent) => {
                return Err(UnitError::compute(format!("{} rejected its input", ctx.partition)))
            }
            Some(Failure::Transient(n)) if attempt <= *n => {
                return Err(UnitError::transient(format!(
                    "{} attempt {} hit a timeout",
                    ctx.partition, attempt
                )))
            }
            Some(Failure::Panic) => panic!("scripted panic in {}", ctx.partition),
            _ => {}
        }

        match &self.inner {
            Some(inner) => inner.compute(ctx).await,
            None => {
                let mut row = Row::new();
                row.insert("key".to_string(), key.into());
                row.insert(
                    "upstream_rows".to_string(),
                    (ctx.all_rows().count() as i64).into(),
                );
                Ok(vec![row])
            }
        }
    }
}

/// Storage wrapper failing the first upserts transiently
#[derive(Clone)]
pub struct FlakyWriter {
    store: Arc<MemoryStore>,
    remaining_failures: Arc<AtomicU32>,
    upserts: Arc<AtomicU32>,
}

impl FlakyWriter {
    pub fn new(store: Arc<MemoryStore>, failures: u32) -> Self {
        Self {
            store,
            remaining_failures: Arc::new(AtomicU32::new(failures)),
            upserts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Upsert calls, including failed ones
    pub fn upserts(&self) -> u32 {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageWriter for FlakyWriter {
    async fn upsert(
        &self,
        asset: &str,
        key: &PartitionKey,
        rows: &[Row],
    ) -> Result<Fingerprint, WriteError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(WriteError::Transient("lock wait timeout".to_string()));
        }
        self.store.upsert(asset, key, rows).await
    }
}

#[async_trait]
impl StorageReader for FlakyWriter {
    async fn read(&self, asset: &str, key: &PartitionKey) -> Result<Vec<Row>, ReadError> {
        self.store.read(asset, key).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
