//! Concurrency control for materialization units
//!
//! [`ResourceLimiter`] bounds units in flight globally and per named resource.
//! [`PartitionLocks`] serializes all transitions of one partition across every
//! scheduler in the process.

use dashmap::DashMap;
use runway_core::PartitionRef;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

use crate::metrics::CONCURRENCY_WAIT_SECONDS;

/// Permits held by a running unit; released on drop
#[derive(Debug)]
pub struct UnitPermit {
    _global: OwnedSemaphorePermit,
    _resources: Vec<OwnedSemaphorePermit>,
}

/// Global and per-resource concurrency limiter
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    global: Arc<Semaphore>,
    max_concurrent: usize,
    resources: Arc<BTreeMap<String, Arc<Semaphore>>>,
}

impl ResourceLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            resources: Arc::new(BTreeMap::new()),
        }
    }

    /// Add sub-limits for named resources such as `postgres: 2`
    pub fn with_resource_limits(mut self, limits: &BTreeMap<String, usize>) -> Self {
        self.resources = Arc::new(
            limits
                .iter()
                .map(|(name, limit)| (name.clone(), Arc::new(Semaphore::new(*limit))))
                .collect(),
        );
        self
    }

    /// Acquire the global permit and one permit per limited resource.
    ///
    /// Resources are acquired in name order so two units sharing resources
    /// cannot deadlock. Unknown resource names are unlimited.
    #[tracing::instrument(
        name = "concurrency.acquire",
        skip(self, resources),
        fields(
            max_concurrent = %self.max_concurrent,
            available_before = tracing::field::Empty,
            wait_duration_ms = tracing::field::Empty,
        )
    )]
    pub async fn acquire(&self, resources: &[String]) -> Result<UnitPermit, String> {
        let span = tracing::Span::current();
        span.record("available_before", self.global.available_permits());
        let start = Instant::now();

        let global = self
            .global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| "Concurrency limiter closed".to_string())?;

        let mut names: Vec<&String> = resources.iter().collect();
        names.sort();
        names.dedup();

        let mut held = Vec::new();
        for name in names {
            if let Some(semaphore) = self.resources.get(name) {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| format!("Resource limiter '{}' closed", name))?;
                held.push(permit);
            }
        }

        let waited = start.elapsed();
        span.record("wait_duration_ms", waited.as_millis() as u64);
        CONCURRENCY_WAIT_SECONDS.observe(waited.as_secs_f64());

        Ok(UnitPermit {
            _global: global,
            _resources: held,
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available(&self) -> usize {
        self.global.available_permits()
    }

    /// Available permits for a named resource, if it is limited
    pub fn available_for(&self, resource: &str) -> Option<usize> {
        self.resources.get(resource).map(|s| s.available_permits())
    }
}

/// Per-partition async locks shared by every scheduler in the process
#[derive(Debug, Clone, Default)]
pub struct PartitionLocks {
    locks: Arc<DashMap<PartitionRef, Arc<Mutex<()>>>>,
}

impl PartitionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock one partition; the guard serializes all of its transitions
    pub async fn lock(&self, partition: &PartitionRef) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(partition.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop locks nobody holds or waits on
    pub fn prune(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_global_limit() {
        let limiter = ResourceLimiter::new(2);
        assert_eq!(limiter.available(), 2);

        let _permit1 = limiter.acquire(&[]).await.unwrap();
        assert_eq!(limiter.available(), 1);

        let _permit2 = limiter.acquire(&[]).await.unwrap();
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test]
    async fn test_resource_sub_limit() {
        let mut limits = BTreeMap::new();
        limits.insert("postgres".to_string(), 1);
        let limiter = ResourceLimiter::new(4).with_resource_limits(&limits);

        let held = limiter.acquire(&["postgres".to_string()]).await.unwrap();
        assert_eq!(limiter.available_for("postgres"), Some(0));
        assert_eq!(limiter.available_for("api"), None);

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            limiter.acquire(&["postgres".to_string()]),
        )
        .await;
        assert!(blocked.is_err());

        drop(held);
        assert!(limiter.acquire(&["postgres".to_string()]).await.is_ok());
    }

    #[tokio::test]
    async fn test_partition_lock_serializes() {
        let locks = PartitionLocks::new();
        let partition = PartitionRef::new("raw_flights", "2024-03-01");

        let guard = locks.lock(&partition).await;
        let second = tokio::time::timeout(Duration::from_millis(50), locks.lock(&partition)).await;
        assert!(second.is_err());

        drop(guard);
        let _again = locks.lock(&partition).await;
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_prune_drops_idle_locks() {
        let locks = PartitionLocks::new();
        {
            let _guard = locks.lock(&PartitionRef::new("a", "k")).await;
        }
        locks.prune();
        assert!(locks.is_empty());
    }
}
