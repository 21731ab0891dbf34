//! CLI commands

pub mod backfill;
pub mod list;
pub mod materialize;
pub mod migrate;

use anyhow::Result;
use runway_core::{ConfigError, GraphError, KeyRange, KeyRangeError, PipelineDefinition, SelectionError};
use runway_runtime::{Orchestrator, RunReport, UnitOutcome};
use runway_storage::FileStore;
use std::sync::Arc;

use crate::config;
use crate::sources::DirectorySourceFetcher;

/// Wire the orchestrator from the pipeline settings
pub async fn build_orchestrator(definition: PipelineDefinition) -> Result<Orchestrator> {
    let catalog = config::open_catalog(&definition.settings).await?;
    let store = Arc::new(FileStore::new(definition.settings.data_dir.clone()));
    let fetcher = Arc::new(DirectorySourceFetcher::new(
        definition.settings.source_dir.clone(),
    ));

    let orchestrator = Orchestrator::builder(definition)
        .catalog(catalog)
        .storage(store.clone(), store)
        .fetcher(fetcher)
        .build()?;
    Ok(orchestrator)
}

/// Parse optional `--from`/`--to` bounds into a range
pub fn range_from_bounds(from: Option<&str>, to: Option<&str>) -> Result<KeyRange, KeyRangeError> {
    let range = KeyRange {
        start: from.map(Into::into),
        end: to.map(Into::into),
    };
    range.validate()?;
    Ok(range)
}

/// Map an error to the process exit code: 2 for configuration, 1 otherwise
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    let config_error = err.chain().any(|cause| {
        cause.is::<ConfigError>()
            || cause.is::<GraphError>()
            || cause.is::<SelectionError>()
            || cause.is::<KeyRangeError>()
            || cause
                .downcast_ref::<runway_runtime::Error>()
                .is_some_and(runway_runtime::Error::is_config_error)
    });
    if config_error {
        crate::EXIT_CONFIG_ERROR
    } else {
        1
    }
}

/// Print a run summary and return its exit code
pub fn print_report(report: &RunReport) -> i32 {
    let counts = report.counts();

    println!("Run {}", report.run_id);
    println!(
        "  {} partition(s) in {} ms",
        counts.total(),
        report.duration().num_milliseconds()
    );
    println!("  Succeeded:   {}", counts.succeeded);
    println!("  Failed:      {}", counts.failed);
    println!("  Quarantined: {}", counts.quarantined);
    println!("  Blocked:     {}", counts.blocked);
    println!("  Cancelled:   {}", counts.cancelled);

    if !report.dispatch_order.is_empty() {
        println!();
        println!("Dispatch order:");
        for (i, partition) in report.dispatch_order.iter().enumerate() {
            println!("  {:>3}. {}", i + 1, partition);
        }
    }

    let unsuccessful: Vec<(_, &UnitOutcome)> = report.unsuccessful().collect();
    if !unsuccessful.is_empty() {
        println!();
        println!("Unsuccessful partitions:");
        for (partition, outcome) in unsuccessful {
            println!("  {} - {}", partition, outcome);
        }
    }

    report.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_exit_with_two() {
        let err = anyhow::Error::new(GraphError::UnknownAsset("nope".to_string()));
        assert_eq!(exit_code_for(&err), 2);

        let err = anyhow::Error::new(runway_runtime::Error::BackfillTooLarge {
            asset: "raw_flights".to_string(),
            count: 400,
            limit: 366,
        });
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn test_context_wrapped_config_error_exits_with_two() {
        let err = anyhow::Error::new(SelectionError::Empty).context("while parsing --select");
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn test_runtime_errors_exit_with_one() {
        let err = anyhow::Error::new(runway_runtime::Error::Internal("lost task".to_string()));
        assert_eq!(exit_code_for(&err), 1);

        let err = anyhow::anyhow!("catalog unavailable");
        assert_eq!(exit_code_for(&err), 1);
    }

    #[test]
    fn test_range_from_bounds() {
        let range = range_from_bounds(Some("2024-03-01"), Some("2024-03-03")).unwrap();
        assert!(range.contains(&"2024-03-02".into()));
        assert!(!range.contains(&"2024-03-04".into()));

        assert!(range_from_bounds(None, None).unwrap().is_unbounded());
        assert!(range_from_bounds(Some("2024-03-05"), Some("2024-03-01")).is_err());
    }
}
