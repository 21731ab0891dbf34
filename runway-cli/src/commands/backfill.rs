//! Backfill command

use anyhow::Result;
use chrono::Utc;
use runway_core::{AssetSelection, KeyRange, PipelineDefinition};
use runway_runtime::BackfillRequest;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Arguments of `runway backfill`
#[derive(Debug, Clone)]
pub struct BackfillArgs {
    pub select: String,
    pub from: String,
    pub to: String,
    pub force: bool,
    pub propagate: bool,
}

impl BackfillArgs {
    fn request(&self) -> Result<BackfillRequest> {
        let selection = AssetSelection::parse(&self.select)?;
        let range = KeyRange::between(self.from.trim(), self.to.trim());
        range.validate()?;

        let mut request = BackfillRequest::new(selection, range, Utc::now().date_naive());
        if self.force {
            request = request.force();
        }
        if !self.propagate {
            request = request.without_propagation();
        }
        Ok(request)
    }
}

/// Plan and run a backfill; returns the run's exit code
pub async fn execute(
    definition: PipelineDefinition,
    args: &BackfillArgs,
    cancel: CancellationToken,
) -> Result<i32> {
    let request = args.request()?;
    let orchestrator = super::build_orchestrator(definition).await?;

    info!(
        selection = %request.selection,
        range = %request.range,
        mode = %request.mode,
        propagate = request.propagate,
        "Starting backfill"
    );
    let report = orchestrator.backfill(&request, cancel).await?;

    if report.outcomes.is_empty() {
        println!("Nothing to backfill in {}", request.range);
        return Ok(0);
    }
    Ok(super::print_report(&report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_runtime::BackfillMode;

    fn args() -> BackfillArgs {
        BackfillArgs {
            select: "raw_flights".to_string(),
            from: "2024-01-01".to_string(),
            to: "2024-01-03".to_string(),
            force: false,
            propagate: true,
        }
    }

    #[test]
    fn test_request_defaults_to_missing_only() {
        let request = args().request().unwrap();
        assert_eq!(request.mode, BackfillMode::MissingOnly);
        assert!(request.propagate);
        assert_eq!(request.range, KeyRange::between("2024-01-01", "2024-01-03"));
    }

    #[test]
    fn test_force_without_propagation() {
        let args = BackfillArgs {
            force: true,
            propagate: false,
            ..args()
        };
        let request = args.request().unwrap();
        assert_eq!(request.mode, BackfillMode::ForceAll);
        assert!(!request.propagate);
    }

    #[test]
    fn test_inverted_range_rejected() {
        let args = BackfillArgs {
            from: "2024-01-05".to_string(),
            ..args()
        };
        let err = args.request().unwrap_err();
        assert_eq!(crate::commands::exit_code_for(&err), 2);
    }
}
