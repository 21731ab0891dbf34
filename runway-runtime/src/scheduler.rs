//! Materialization scheduler
//!
//! Runs a [`WorkSet`] to completion. A single coordinator loop owns every
//! readiness decision: it marks the work set `pending`, moves partitions whose
//! upstreams all succeeded onto a ready queue, dispatches them in
//! topological-then-key order up to the concurrency limit and re-evaluates
//! dependents as units finish. Each dispatched unit runs on its own tokio task
//! under the partition's lock:
//!
//! ```text
//! acquire -> snapshot/in_progress -> load -> compute -> write -> gate -> record
//! ```
//!
//! Cancellation is checked between steps. Unit-local errors and panics end as
//! catalog state transitions and never escape [`MaterializationScheduler::run`].

use chrono::{NaiveDate, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use runway_core::{
    AssetGraph, Fingerprint, PartitionRecord, PartitionRef, PartitionState, QualityCheck, Row,
    StorageReader, StorageWriter,
};
use runway_storage::{PartitionCatalog, StateChange};
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::checks::BuiltinCheckRunner;
use crate::compute::ComputeRegistry;
use crate::concurrency::{PartitionLocks, ResourceLimiter};
use crate::metrics::{RETRIES_TOTAL, UNITS_TOTAL, UNIT_DURATION};
use crate::quality_gate::{CheckRunner, DataQualityGate, GateVerdict, MaterializedOutput};
use crate::report::{RunReport, UnitOutcome};
use crate::resolver::WorkSet;
use crate::retry::RetryPolicy;
use crate::state_machine::StateMachine;
use crate::unit::{
    AssetCompute, ComputeContext, MaterializationUnit, UnitError, UnitStep, UpstreamInput,
};
use crate::{Error, Result};

/// Builder for [`MaterializationScheduler`]
pub struct SchedulerBuilder {
    graph: Arc<AssetGraph>,
    catalog: Arc<dyn PartitionCatalog>,
    writer: Arc<dyn StorageWriter>,
    reader: Arc<dyn StorageReader>,
    computes: ComputeRegistry,
    checks: BTreeMap<String, Vec<QualityCheck>>,
    check_runner: Option<Arc<dyn CheckRunner>>,
    retry: RetryPolicy,
    concurrency: usize,
    resource_limits: BTreeMap<String, usize>,
    locks: Option<PartitionLocks>,
}

impl SchedulerBuilder {
    pub fn computes(mut self, computes: ComputeRegistry) -> Self {
        self.computes = computes;
        self
    }

    /// Quality checks per asset
    pub fn checks(mut self, checks: BTreeMap<String, Vec<QualityCheck>>) -> Self {
        self.checks = checks;
        self
    }

    /// Replace the built-in check runner
    pub fn check_runner(mut self, runner: Arc<dyn CheckRunner>) -> Self {
        self.check_runner = Some(runner);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Maximum units in flight
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn resource_limits(mut self, limits: BTreeMap<String, usize>) -> Self {
        self.resource_limits = limits;
        self
    }

    /// Share partition locks with other schedulers in the process
    pub fn partition_locks(mut self, locks: PartitionLocks) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn build(self) -> Result<MaterializationScheduler> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be > 0".to_string()));
        }

        let runner = self.check_runner.unwrap_or_else(|| {
            Arc::new(BuiltinCheckRunner::new(
                self.reader.clone(),
                self.graph.clone(),
            ))
        });

        Ok(MaterializationScheduler {
            inner: Arc::new(SchedulerInner {
                graph: self.graph,
                catalog: self.catalog,
                writer: self.writer,
                reader: self.reader,
                computes: self.computes,
                checks: self.checks,
                gate: DataQualityGate::new(runner),
                retry: self.retry,
                limiter: ResourceLimiter::new(self.concurrency)
                    .with_resource_limits(&self.resource_limits),
                locks: self.locks.unwrap_or_default(),
                concurrency: self.concurrency,
            }),
        })
    }
}

/// Dispatches materialization units for a work set
#[derive(Clone)]
pub struct MaterializationScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    graph: Arc<AssetGraph>,
    catalog: Arc<dyn PartitionCatalog>,
    writer: Arc<dyn StorageWriter>,
    reader: Arc<dyn StorageReader>,
    computes: ComputeRegistry,
    checks: BTreeMap<String, Vec<QualityCheck>>,
    gate: DataQualityGate,
    retry: RetryPolicy,
    limiter: ResourceLimiter,
    locks: PartitionLocks,
    concurrency: usize,
}

/// Coordinator-side bookkeeping for one work-set partition
struct RunEntry {
    position: usize,
    spec: UnitSpec,
    machine: StateMachine,
}

/// Everything a unit task needs
struct UnitSpec {
    partition: PartitionRef,
    upstreams: Vec<PartitionRef>,
    compute: Arc<dyn AssetCompute>,
    checks: Vec<QualityCheck>,
    resources: Vec<String>,
}

/// Committed and gated output of a unit
struct Materialized {
    unit: MaterializationUnit,
    commit: Fingerprint,
    row_count: u64,
    verdict: GateVerdict,
    attempts: u32,
}

/// Why a unit stopped before recording success
#[derive(Debug)]
struct UnitFailure {
    error: UnitError,
    attempts: u32,
}

impl UnitFailure {
    fn new(error: UnitError, attempts: u32) -> Self {
        Self { error, attempts }
    }

    fn cancelled(attempts: u32) -> Self {
        Self::new(UnitError::Cancelled, attempts)
    }
}

enum Readiness {
    Ready,
    Wait,
    Blocked(PartitionRef),
}

impl MaterializationScheduler {
    pub fn builder(
        graph: Arc<AssetGraph>,
        catalog: Arc<dyn PartitionCatalog>,
        writer: Arc<dyn StorageWriter>,
        reader: Arc<dyn StorageReader>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            graph,
            catalog,
            writer,
            reader,
            computes: ComputeRegistry::new(),
            checks: BTreeMap::new(),
            check_runner: None,
            retry: RetryPolicy::default(),
            concurrency: 4,
            resource_limits: BTreeMap::new(),
            locks: None,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    pub fn partition_locks(&self) -> &PartitionLocks {
        &self.inner.locks
    }

    /// Materialize every partition of `work`.
    ///
    /// Returns an error only for problems detected before or while marking the
    /// work set pending; everything after that is reported per partition.
    #[instrument(
        name = "scheduler.run",
        skip(self, work, cancel),
        fields(run_id = tracing::field::Empty, partitions = work.len())
    )]
    pub async fn run(
        &self,
        work: WorkSet,
        today: NaiveDate,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        if work.is_empty() {
            info!("Nothing to materialize");
            return Ok(RunReport::empty());
        }
        if let Some(missing) = work
            .partitions()
            .find(|p| !self.inner.computes.contains(&p.asset))
        {
            return Err(Error::MissingCompute(missing.asset.clone()));
        }

        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        let started_at = Utc::now();

        let inner = &self.inner;
        let mut entries: BTreeMap<PartitionRef, RunEntry> = BTreeMap::new();
        for (position, item) in work.into_iter().enumerate() {
            let spec = self.unit_spec(item.partition.clone(), today)?;
            entries.insert(
                item.partition,
                RunEntry {
                    position,
                    spec,
                    machine: StateMachine::new(PartitionState::Missing),
                },
            );
        }
        let in_run: HashSet<PartitionRef> = entries.keys().cloned().collect();

        let mut refs: Vec<PartitionRef> = in_run.iter().cloned().collect();
        for entry in entries.values() {
            refs.extend(
                entry
                    .spec
                    .upstreams
                    .iter()
                    .filter(|u| !in_run.contains(*u))
                    .cloned(),
            );
        }
        refs.sort();
        refs.dedup();
        let initial = inner.catalog.snapshot(&refs).await?;

        let mut waiting: BTreeMap<usize, PartitionRef> = BTreeMap::new();
        let partitions: Vec<PartitionRef> = entries.keys().cloned().collect();
        for partition in partitions {
            let prior = initial
                .get(&partition)
                .map(|record| record.state)
                .unwrap_or_default();
            if let Err(e) = self.mark_pending(&partition, prior, &mut entries, &mut waiting).await {
                error!(partition = %partition, error = %e, "Failed to mark work set pending");
                self.release_marked(waiting, &mut entries).await;
                inner.locks.prune();
                return Err(e);
            }
        }

        info!(partitions = entries.len(), concurrency = inner.concurrency, "Run started");

        let mut ready: BTreeMap<usize, PartitionRef> = BTreeMap::new();
        let mut outcomes: BTreeMap<PartitionRef, UnitOutcome> = BTreeMap::new();
        let mut dispatch_order = Vec::new();
        let mut completion_order = Vec::new();
        let mut in_flight = FuturesUnordered::new();

        loop {
            if !cancel.is_cancelled() {
                self.promote(
                    &mut waiting,
                    &mut ready,
                    &mut entries,
                    &mut outcomes,
                    &in_run,
                    &initial,
                )
                .await;

                while in_flight.len() < inner.concurrency {
                    let Some((_, partition)) = ready.pop_first() else {
                        break;
                    };
                    let Some(entry) = entries.remove(&partition) else {
                        continue;
                    };
                    debug!(partition = %partition, "Dispatching unit");
                    dispatch_order.push(partition.clone());

                    let task = tokio::spawn(inner.clone().execute(
                        entry.spec,
                        entry.machine,
                        cancel.clone(),
                    ));
                    in_flight.push(async move { (partition, task.await) });
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !cancel.is_cancelled() => {
                    warn!(in_flight = in_flight.len(), "Run cancelled, draining in-flight units");
                }
                Some((partition, joined)) = in_flight.next() => {
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => inner.task_lost(&partition, e.to_string()).await,
                    };
                    completion_order.push(partition.clone());
                    outcomes.insert(partition, outcome);
                }
            }
        }

        let leftover: Vec<PartitionRef> = waiting.into_values().chain(ready.into_values()).collect();
        if !leftover.is_empty() && !cancel.is_cancelled() {
            error!(remaining = leftover.len(), "Run stalled with undispatched partitions");
        }
        for partition in leftover {
            if let Some(mut entry) = entries.remove(&partition) {
                let _guard = inner.locks.lock(&partition).await;
                inner.release(&partition, &mut entry.machine, None).await;
            }
            UNITS_TOTAL.with_label_values(&["cancelled"]).inc();
            outcomes.insert(partition, UnitOutcome::Cancelled);
        }
        inner.locks.prune();

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcomes,
            dispatch_order,
            completion_order,
        };
        let counts = report.counts();
        info!(
            succeeded = counts.succeeded,
            failed = counts.failed,
            quarantined = counts.quarantined,
            blocked = counts.blocked,
            cancelled = counts.cancelled,
            duration_ms = report.duration().num_milliseconds(),
            "Run finished"
        );
        Ok(report)
    }

    async fn mark_pending(
        &self,
        partition: &PartitionRef,
        prior: PartitionState,
        entries: &mut BTreeMap<PartitionRef, RunEntry>,
        waiting: &mut BTreeMap<usize, PartitionRef>,
    ) -> Result<()> {
        let Some(entry) = entries.get_mut(partition) else {
            return Ok(());
        };
        let _guard = self.inner.locks.lock(partition).await;
        let mut machine = StateMachine::new(prior);
        machine.transition(PartitionState::Pending).map_err(Error::Internal)?;
        self.inner
            .catalog
            .record_state(StateChange::new(partition.clone(), PartitionState::Pending))
            .await?;
        entry.machine = machine;
        waiting.insert(entry.position, partition.clone());
        Ok(())
    }

    /// Undo a partially marked work set
    async fn release_marked(
        &self,
        marked: BTreeMap<usize, PartitionRef>,
        entries: &mut BTreeMap<PartitionRef, RunEntry>,
    ) {
        for partition in marked.into_values() {
            if let Some(entry) = entries.get_mut(&partition) {
                let _guard = self.inner.locks.lock(&partition).await;
                self.inner.release(&partition, &mut entry.machine, None).await;
            }
        }
    }

    fn unit_spec(&self, partition: PartitionRef, today: NaiveDate) -> Result<UnitSpec> {
        let inner = &self.inner;
        let upstreams = inner
            .graph
            .upstream_partitions(&partition.asset, &partition.key, today)?;
        let compute = inner
            .computes
            .get(&partition.asset)
            .ok_or_else(|| Error::MissingCompute(partition.asset.clone()))?;
        let resources = inner.graph.node(&partition.asset)?.resources.clone();
        let checks = inner
            .checks
            .get(&partition.asset)
            .cloned()
            .unwrap_or_default();

        Ok(UnitSpec {
            partition,
            upstreams,
            compute,
            checks,
            resources,
        })
    }

    /// Move waiting partitions to the ready queue or mark them blocked.
    ///
    /// Walks in work-set order, so a block cascades to dependents in one pass.
    async fn promote(
        &self,
        waiting: &mut BTreeMap<usize, PartitionRef>,
        ready: &mut BTreeMap<usize, PartitionRef>,
        entries: &mut BTreeMap<PartitionRef, RunEntry>,
        outcomes: &mut BTreeMap<PartitionRef, UnitOutcome>,
        in_run: &HashSet<PartitionRef>,
        initial: &BTreeMap<PartitionRef, PartitionRecord>,
    ) {
        let positions: Vec<usize> = waiting.keys().copied().collect();
        for position in positions {
            let Some(partition) = waiting.get(&position).cloned() else {
                continue;
            };
            let Some(entry) = entries.get(&partition) else {
                continue;
            };

            match readiness(&entry.spec.upstreams, in_run, outcomes, initial) {
                Readiness::Wait => {}
                Readiness::Ready => {
                    waiting.remove(&position);
                    ready.insert(position, partition);
                }
                Readiness::Blocked(by) => {
                    waiting.remove(&position);
                    if let Some(mut entry) = entries.remove(&partition) {
                        let _guard = self.inner.locks.lock(&partition).await;
                        self.inner
                            .release(&partition, &mut entry.machine, Some(by.clone()))
                            .await;
                    }
                    info!(partition = %partition, blocked_by = %by, "Partition blocked");
                    UNITS_TOTAL.with_label_values(&["blocked"]).inc();
                    outcomes.insert(partition, UnitOutcome::Blocked { by });
                }
            }
        }
    }
}

fn readiness(
    upstreams: &[PartitionRef],
    in_run: &HashSet<PartitionRef>,
    outcomes: &BTreeMap<PartitionRef, UnitOutcome>,
    initial: &BTreeMap<PartitionRef, PartitionRecord>,
) -> Readiness {
    let mut wait = false;
    for upstream in upstreams {
        if in_run.contains(upstream) {
            match outcomes.get(upstream) {
                Some(outcome) if outcome.is_success() => {}
                Some(_) => return Readiness::Blocked(upstream.clone()),
                None => wait = true,
            }
        } else {
            let succeeded = initial
                .get(upstream)
                .map_or(false, |record| record.state == PartitionState::Succeeded);
            if !succeeded {
                return Readiness::Blocked(upstream.clone());
            }
        }
    }
    if wait {
        Readiness::Wait
    } else {
        Readiness::Ready
    }
}

impl SchedulerInner {
    /// Run one unit to a terminal outcome
    async fn execute(
        self: Arc<Self>,
        spec: UnitSpec,
        mut machine: StateMachine,
        cancel: CancellationToken,
    ) -> UnitOutcome {
        let span = info_span!(
            "scheduler.unit",
            partition = %spec.partition,
            kind = spec.compute.kind(),
        );

        async move {
            let started = Instant::now();
            let _guard = self.locks.lock(&spec.partition).await;

            let result = AssertUnwindSafe(self.materialize(&spec, &mut machine, &cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    let message = panic_message(payload);
                    error!(error = %message, "Unit panicked");
                    Err(UnitFailure::new(UnitError::Panicked(message), 1))
                });

            let outcome = self.finish(&spec.partition, &mut machine, result).await;

            UNITS_TOTAL.with_label_values(&[outcome.as_str()]).inc();
            UNIT_DURATION
                .with_label_values(&[spec.partition.asset.as_str()])
                .observe(started.elapsed().as_secs_f64());
            outcome
        }
        .instrument(span)
        .await
    }

    async fn materialize(
        &self,
        spec: &UnitSpec,
        machine: &mut StateMachine,
        cancel: &CancellationToken,
    ) -> std::result::Result<Materialized, UnitFailure> {
        let partition = &spec.partition;

        checkpoint(cancel, UnitStep::Acquire)?;
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UnitFailure::cancelled(0)),
            permit = self.limiter.acquire(&spec.resources) => {
                permit.map_err(|e| UnitFailure::new(UnitError::compute(e), 0))?
            }
        };

        let mut refs = spec.upstreams.clone();
        refs.push(partition.clone());
        let snapshot = self
            .catalog
            .snapshot(&refs)
            .await
            .map_err(|e| UnitFailure::new(UnitError::Catalog(e.to_string()), 0))?;
        let input_fingerprint = crate::resolver::expected_fingerprint(&spec.upstreams, &snapshot);
        let last_success_at = snapshot.get(partition).and_then(|r| r.last_success_at);

        self.transition(machine, StateChange::new(partition.clone(), PartitionState::InProgress))
            .await
            .map_err(|e| UnitFailure::new(e, 0))?;

        let unit = MaterializationUnit {
            partition: partition.clone(),
            upstreams: spec.upstreams.clone(),
            input_fingerprint,
            last_success_at,
        };

        checkpoint(cancel, UnitStep::Load)?;
        let inputs = if spec.compute.reads_upstreams() {
            self.load_inputs(&unit, cancel).await?
        } else {
            Vec::new()
        };

        checkpoint(cancel, UnitStep::Compute)?;
        let mut ctx = ComputeContext {
            partition: partition.clone(),
            inputs,
            last_success_at: unit.last_success_at,
            attempt: 1,
        };
        let mut retries = 0;
        let rows: Vec<Row> = loop {
            ctx.attempt = retries + 1;
            match spec.compute.compute(&ctx).await {
                Ok(rows) => break rows,
                Err(e) => {
                    self.backoff(UnitStep::Compute, partition, e, &mut retries, cancel)
                        .await?
                }
            }
        };
        let attempts = retries + 1;
        drop(ctx);

        checkpoint(cancel, UnitStep::Write)?;
        let mut retries = 0;
        let commit = loop {
            match self
                .writer
                .upsert(&partition.asset, &partition.key, &rows)
                .await
            {
                Ok(commit) => break commit,
                Err(e) => {
                    self.backoff(UnitStep::Write, partition, e.into(), &mut retries, cancel)
                        .await?
                }
            }
        };
        let row_count = rows.len() as u64;
        debug!(rows = row_count, commit = %commit, "Output committed");

        checkpoint(cancel, UnitStep::Gate)?;
        let verdict = self
            .gate
            .evaluate(&spec.checks, &MaterializedOutput::new(partition.clone(), rows))
            .await;

        checkpoint(cancel, UnitStep::Record)?;
        Ok(Materialized {
            unit,
            commit,
            row_count,
            verdict,
            attempts,
        })
    }

    async fn load_inputs(
        &self,
        unit: &MaterializationUnit,
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<UpstreamInput>, UnitFailure> {
        let mut inputs = Vec::with_capacity(unit.upstreams.len());
        for upstream in &unit.upstreams {
            let mut retries = 0;
            let rows = loop {
                match self.reader.read(&upstream.asset, &upstream.key).await {
                    Ok(rows) => break rows,
                    Err(e) => {
                        self.backoff(UnitStep::Load, &unit.partition, e.into(), &mut retries, cancel)
                            .await?
                    }
                }
            };
            inputs.push(UpstreamInput {
                partition: upstream.clone(),
                rows,
            });
        }
        Ok(inputs)
    }

    /// Sleep before the next attempt, or give up on permanent errors and
    /// exhausted retries
    async fn backoff(
        &self,
        step: UnitStep,
        partition: &PartitionRef,
        error: UnitError,
        retries: &mut u32,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), UnitFailure> {
        if !error.is_transient() || !self.retry.should_retry(*retries) {
            return Err(UnitFailure::new(error, *retries + 1));
        }

        let delay = self.retry.calculate_delay(*retries);
        *retries += 1;
        RETRIES_TOTAL.with_label_values(&[step.as_str()]).inc();
        warn!(
            partition = %partition,
            step = %step,
            retry = *retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient failure, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(UnitFailure::cancelled(*retries)),
        }
    }

    /// Record the terminal state of a dispatched unit
    async fn finish(
        &self,
        partition: &PartitionRef,
        machine: &mut StateMachine,
        result: std::result::Result<Materialized, UnitFailure>,
    ) -> UnitOutcome {
        match result {
            Ok(done) => {
                let passed = done.verdict.passed();
                let state = if passed {
                    PartitionState::Succeeded
                } else {
                    PartitionState::Quarantined
                };
                let change = StateChange::new(partition.clone(), state)
                    .with_input_fingerprint(done.unit.input_fingerprint)
                    .with_commit(done.commit.clone(), done.row_count)
                    .with_quality_results(done.verdict.results.clone());

                if let Err(e) = self.transition(machine, change).await {
                    error!(error = %e, "Failed to record materialization");
                    return UnitOutcome::Failed {
                        error: e.to_string(),
                        attempts: done.attempts,
                    };
                }

                if passed {
                    info!(rows = done.row_count, attempts = done.attempts, "Partition materialized");
                    UnitOutcome::Succeeded {
                        row_count: done.row_count,
                        output_fingerprint: done.commit,
                        attempts: done.attempts,
                    }
                } else {
                    let failed_checks = done.verdict.blocking_failures();
                    warn!(failed_checks = failed_checks.len(), "Partition quarantined");
                    UnitOutcome::Quarantined { failed_checks }
                }
            }
            Err(failure) if failure.error == UnitError::Cancelled => {
                self.release(partition, machine, None).await;
                info!("Unit cancelled");
                UnitOutcome::Cancelled
            }
            Err(failure) => {
                error!(error = %failure.error, attempts = failure.attempts, "Unit failed");
                if machine.current_state() == PartitionState::Pending {
                    // Never reached in_progress
                    if let Err(e) = machine.transition(PartitionState::InProgress) {
                        error!(error = %e, "Invalid state transition");
                    }
                }
                let change = StateChange::new(partition.clone(), PartitionState::Failed);
                if let Err(e) = self.transition(machine, change).await {
                    error!(error = %e, "Failed to record failure");
                }
                UnitOutcome::Failed {
                    error: failure.error.to_string(),
                    attempts: failure.attempts,
                }
            }
        }
    }

    async fn transition(
        &self,
        machine: &mut StateMachine,
        change: StateChange,
    ) -> std::result::Result<PartitionRecord, UnitError> {
        machine.transition(change.state).map_err(UnitError::Catalog)?;
        self.catalog
            .record_state(change)
            .await
            .map_err(|e| UnitError::Catalog(e.to_string()))
    }

    /// Restore the pre-run state, optionally noting the blocking upstream.
    ///
    /// The caller holds the partition lock.
    async fn release(
        &self,
        partition: &PartitionRef,
        machine: &mut StateMachine,
        blocked_by: Option<PartitionRef>,
    ) {
        let prior = match machine.release() {
            Ok(prior) => prior,
            Err(e) => {
                error!(partition = %partition, error = %e, "Cannot release partition");
                return;
            }
        };

        let mut change = StateChange::new(partition.clone(), prior);
        if let Some(upstream) = blocked_by {
            change = change.blocked_by(upstream);
        }

        if let Err(e) = self.catalog.record_state(change).await {
            error!(partition = %partition, error = %e, "Failed to release partition");
        }
    }

    /// A unit task ended without returning an outcome
    async fn task_lost(&self, partition: &PartitionRef, reason: String) -> UnitOutcome {
        error!(partition = %partition, error = %reason, "Unit task aborted");
        let _guard = self.locks.lock(partition).await;
        if let Err(e) = self
            .catalog
            .record_state(StateChange::new(partition.clone(), PartitionState::Failed))
            .await
        {
            error!(partition = %partition, error = %e, "Failed to record failure");
        }
        UNITS_TOTAL.with_label_values(&["failed"]).inc();
        UnitOutcome::Failed {
            error: UnitError::Panicked(reason).to_string(),
            attempts: 1,
        }
    }
}

fn checkpoint(cancel: &CancellationToken, step: UnitStep) -> std::result::Result<(), UnitFailure> {
    if cancel.is_cancelled() {
        debug!(step = %step, "Cancellation observed at checkpoint");
        return Err(UnitFailure::cancelled(0));
    }
    Ok(())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{StaleReason, WorkItem};
    use async_trait::async_trait;
    use runway_core::{AssetNode, CheckType, PartitionMapping};
    use runway_storage::{InMemoryCatalog, MemoryStore};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Emits one row per upstream row plus one, failing transiently for the
    /// first `flaky` attempts
    struct CountingCompute {
        calls: AtomicU32,
        flaky: u32,
        fail: bool,
    }

    impl CountingCompute {
        fn ok() -> Arc<dyn AssetCompute> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                flaky: 0,
                fail: false,
            })
        }
    }

    #[async_trait]
    impl AssetCompute for CountingCompute {
        fn kind(&self) -> &'static str {
            "counting"
        }

        async fn compute(&self, ctx: &ComputeContext) -> std::result::Result<Vec<Row>, UnitError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(UnitError::compute("bad input"));
            }
            if call < self.flaky {
                return Err(UnitError::transient("flaky"));
            }
            let mut row = Row::new();
            row.insert("key".into(), ctx.partition.key.as_str().into());
            row.insert("upstream_rows".into(), (ctx.all_rows().count() as i64).into());
            Ok(vec![row])
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn graph() -> Arc<AssetGraph> {
        let mut graph = AssetGraph::new();
        for name in ["a", "b", "c"] {
            graph
                .register(AssetNode::builder(name).partitioned_daily(day(1)).build())
                .unwrap();
        }
        graph.add_edge("a", "b", PartitionMapping::Identity).unwrap();
        Arc::new(graph)
    }

    fn work(graph: &AssetGraph, partitions: &[(&str, &str)]) -> WorkSet {
        WorkSet::ordered(
            graph,
            partitions.iter().map(|(asset, key)| WorkItem {
                partition: PartitionRef::new(*asset, *key),
                reason: StaleReason::Missing,
            }),
        )
    }

    fn scheduler(
        graph: Arc<AssetGraph>,
        catalog: Arc<InMemoryCatalog>,
        computes: Vec<(&str, Arc<dyn AssetCompute>)>,
    ) -> SchedulerBuilder {
        let store = Arc::new(MemoryStore::new());
        let mut registry = ComputeRegistry::new();
        for (asset, compute) in computes {
            registry.insert(asset, compute);
        }
        MaterializationScheduler::builder(graph, catalog, store.clone(), store)
            .computes(registry)
            .retry_policy(RetryPolicy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..RetryPolicy::default()
            })
    }

    async fn state(catalog: &InMemoryCatalog, asset: &str) -> PartitionState {
        catalog
            .get(&PartitionRef::new(asset, "2024-03-01"))
            .await
            .unwrap()
            .map(|r| r.state)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_chain_runs_in_dependency_order() {
        let graph = graph();
        let catalog = Arc::new(InMemoryCatalog::new());
        let scheduler = scheduler(
            graph.clone(),
            catalog.clone(),
            vec![("a", CountingCompute::ok()), ("b", CountingCompute::ok())],
        )
        .concurrency(1)
        .build()
        .unwrap();

        let report = scheduler
            .run(
                work(&graph, &[("b", "2024-03-01"), ("a", "2024-03-01")]),
                day(1),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(
            report.dispatch_order,
            vec![
                PartitionRef::new("a", "2024-03-01"),
                PartitionRef::new("b", "2024-03-01")
            ]
        );
        assert_eq!(state(&catalog, "b").await, PartitionState::Succeeded);
        // locks of finished units are dropped
        assert!(scheduler.partition_locks().is_empty());
    }

    #[tokio::test]
    async fn test_failure_blocks_only_dependents() {
        let graph = graph();
        let catalog = Arc::new(InMemoryCatalog::new());
        let failing = Arc::new(CountingCompute {
            calls: AtomicU32::new(0),
            flaky: 0,
            fail: true,
        });
        let scheduler = scheduler(
            graph.clone(),
            catalog.clone(),
            vec![
                ("a", failing.clone() as Arc<dyn AssetCompute>),
                ("b", CountingCompute::ok()),
                ("c", CountingCompute::ok()),
            ],
        )
        .build()
        .unwrap();

        let report = scheduler
            .run(
                work(
                    &graph,
                    &[("a", "2024-03-01"), ("b", "2024-03-01"), ("c", "2024-03-01")],
                ),
                day(1),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let counts = report.counts();
        assert_eq!((counts.succeeded, counts.failed, counts.blocked), (1, 1, 1));
        // permanent errors are not retried
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);

        let b = catalog
            .get(&PartitionRef::new("b", "2024-03-01"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.state, PartitionState::Missing);
        assert_eq!(b.blocked_by, Some(PartitionRef::new("a", "2024-03-01")));
        assert_eq!(state(&catalog, "a").await, PartitionState::Failed);
        assert_eq!(state(&catalog, "c").await, PartitionState::Succeeded);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let graph = graph();
        let catalog = Arc::new(InMemoryCatalog::new());
        let flaky = Arc::new(CountingCompute {
            calls: AtomicU32::new(0),
            flaky: 2,
            fail: false,
        });
        let scheduler = scheduler(
            graph.clone(),
            catalog,
            vec![("a", flaky.clone() as Arc<dyn AssetCompute>)],
        )
        .build()
        .unwrap();

        let report = scheduler
            .run(
                work(&graph, &[("a", "2024-03-01")]),
                day(1),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        match report.outcome(&PartitionRef::new("a", "2024-03-01")) {
            Some(UnitOutcome::Succeeded { attempts, .. }) => assert_eq!(*attempts, 3),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let graph = graph();
        let catalog = Arc::new(InMemoryCatalog::new());
        let flaky = Arc::new(CountingCompute {
            calls: AtomicU32::new(0),
            flaky: 100,
            fail: false,
        });
        let scheduler = scheduler(
            graph.clone(),
            catalog,
            vec![("a", flaky.clone() as Arc<dyn AssetCompute>)],
        )
        .build()
        .unwrap();

        let report = scheduler
            .run(
                work(&graph, &[("a", "2024-03-01")]),
                day(1),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        // first attempt plus three retries
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);
        assert_eq!(report.counts().failed, 1);
    }

    struct PanickingCompute;

    #[async_trait]
    impl AssetCompute for PanickingCompute {
        fn kind(&self) -> &'static str {
            "panicking"
        }

        async fn compute(&self, _ctx: &ComputeContext) -> std::result::Result<Vec<Row>, UnitError> {
            panic!("compute exploded");
        }
    }

    #[tokio::test]
    async fn test_panic_is_recorded_as_failure() {
        let graph = graph();
        let catalog = Arc::new(InMemoryCatalog::new());
        let scheduler = scheduler(
            graph.clone(),
            catalog.clone(),
            vec![("a", Arc::new(PanickingCompute) as Arc<dyn AssetCompute>)],
        )
        .build()
        .unwrap();

        let report = scheduler
            .run(
                work(&graph, &[("a", "2024-03-01")]),
                day(1),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        match report.outcome(&PartitionRef::new("a", "2024-03-01")) {
            Some(UnitOutcome::Failed { error, .. }) => assert!(error.contains("compute exploded")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(state(&catalog, "a").await, PartitionState::Failed);
    }

    #[tokio::test]
    async fn test_blocking_check_quarantines_and_blocks_dependent() {
        let graph = graph();
        let catalog = Arc::new(InMemoryCatalog::new());
        let mut checks = BTreeMap::new();
        checks.insert(
            "a".to_string(),
            vec![QualityCheck::new(
                "min_rows",
                "a",
                CheckType::RowCount {
                    min: Some(10),
                    max: None,
                },
            )],
        );
        let scheduler = scheduler(
            graph.clone(),
            catalog.clone(),
            vec![("a", CountingCompute::ok()), ("b", CountingCompute::ok())],
        )
        .checks(checks)
        .build()
        .unwrap();

        let report = scheduler
            .run(
                work(&graph, &[("a", "2024-03-01"), ("b", "2024-03-01")]),
                day(1),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.counts().quarantined, 1);
        assert_eq!(report.counts().blocked, 1);
        let a = catalog
            .get(&PartitionRef::new("a", "2024-03-01"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.state, PartitionState::Quarantined);
        assert_eq!(a.row_count, Some(1));
        assert_eq!(a.quality_results.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_releases_everything() {
        let graph = graph();
        let catalog = Arc::new(InMemoryCatalog::new());
        let scheduler = scheduler(
            graph.clone(),
            catalog.clone(),
            vec![("a", CountingCompute::ok()), ("b", CountingCompute::ok())],
        )
        .build()
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = scheduler
            .run(
                work(&graph, &[("a", "2024-03-01"), ("b", "2024-03-01")]),
                day(1),
                cancel,
            )
            .await
            .unwrap();

        assert_eq!(report.counts().cancelled, 2);
        assert!(report.dispatch_order.is_empty());
        assert_eq!(state(&catalog, "a").await, PartitionState::Missing);
        assert_eq!(state(&catalog, "b").await, PartitionState::Missing);
    }

    #[tokio::test]
    async fn test_missing_compute_is_rejected_before_any_transition() {
        let graph = graph();
        let catalog = Arc::new(InMemoryCatalog::new());
        let scheduler = scheduler(graph.clone(), catalog.clone(), vec![])
            .build()
            .unwrap();

        let result = scheduler
            .run(
                work(&graph, &[("a", "2024-03-01")]),
                day(1),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(Error::MissingCompute(asset)) if asset == "a"));
        assert!(catalog.is_empty());
    }

    /// Rejects the `pending` write for one partition
    struct RejectingCatalog {
        inner: InMemoryCatalog,
        reject: PartitionRef,
    }

    #[async_trait]
    impl PartitionCatalog for RejectingCatalog {
        async fn record_state(&self, change: StateChange) -> runway_storage::Result<PartitionRecord> {
            if change.partition == self.reject && change.state == PartitionState::Pending {
                return Err(runway_storage::Error::ConnectionFailed("catalog offline".into()));
            }
            self.inner.record_state(change).await
        }

        async fn get(&self, partition: &PartitionRef) -> runway_storage::Result<Option<PartitionRecord>> {
            self.inner.get(partition).await
        }

        async fn list_page(
            &self,
            asset: &str,
            range: &runway_core::KeyRange,
            after: Option<&runway_core::PartitionKey>,
            limit: usize,
        ) -> runway_storage::Result<Vec<PartitionRecord>> {
            self.inner.list_page(asset, range, after, limit).await
        }

        async fn snapshot(
            &self,
            partitions: &[PartitionRef],
        ) -> runway_storage::Result<BTreeMap<PartitionRef, PartitionRecord>> {
            self.inner.snapshot(partitions).await
        }
    }

    #[tokio::test]
    async fn test_failed_pending_mark_releases_marked_partitions() {
        let graph = graph();
        let catalog = Arc::new(RejectingCatalog {
            inner: InMemoryCatalog::new(),
            reject: PartitionRef::new("c", "2024-03-01"),
        });
        let store = Arc::new(MemoryStore::new());
        let mut registry = ComputeRegistry::new();
        for asset in ["a", "c"] {
            registry.insert(asset, CountingCompute::ok());
        }
        let scheduler =
            MaterializationScheduler::builder(graph.clone(), catalog.clone(), store.clone(), store)
                .computes(registry)
                .build()
                .unwrap();

        let result = scheduler
            .run(
                work(
                    &graph,
                    &[("a", "2024-03-01"), ("a", "2024-03-02"), ("c", "2024-03-01")],
                ),
                day(2),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(Error::Storage(_))));
        for key in ["2024-03-01", "2024-03-02"] {
            let record = catalog
                .get(&PartitionRef::new("a", key))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.state, PartitionState::Missing);
        }
        assert!(catalog
            .get(&PartitionRef::new("c", "2024-03-01"))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let result = MaterializationScheduler::builder(
            graph(),
            Arc::new(InMemoryCatalog::new()),
            store.clone(),
            store,
        )
        .concurrency(0)
        .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
