//! Materialize command

use anyhow::Result;
use chrono::Utc;
use runway_core::{AssetSelection, KeyRange, PipelineDefinition};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Materialize stale partitions; returns the run's exit code
pub async fn execute(
    definition: PipelineDefinition,
    select: &str,
    partition: Option<&str>,
    cancel: CancellationToken,
) -> Result<i32> {
    let selection = AssetSelection::parse(select)?;
    let range = match partition {
        Some(spec) => KeyRange::parse(spec)?,
        None => KeyRange::all(),
    };

    let orchestrator = super::build_orchestrator(definition).await?;
    let today = Utc::now().date_naive();

    info!(selection = %selection, range = %range, "Starting materialization");
    let report = orchestrator
        .materialize(&selection, &range, today, cancel)
        .await?;

    if report.outcomes.is_empty() {
        println!("All selected partitions are up to date");
        return Ok(0);
    }
    Ok(super::print_report(&report))
}
