//! End-to-end backfill tests

use runway_core::{PartitionRef, PartitionState};
use runway_runtime::{BackfillMode, StaleReason};
use runway_tests::assertions::{assert_state, assert_up_to_date};
use runway_tests::{dates, pipelines, rows, ReportAssertions, StaticFetcher, TestHarness};
use std::collections::BTreeMap;

fn key(day: u32) -> String {
    dates::key(day)
}

fn harness() -> TestHarness {
    TestHarness::builder(pipelines::flights_chain())
        .fetcher(StaticFetcher::new().with_source("flights", rows::flights_for_days(&[1, 2, 3])))
        .build()
}

async fn fingerprints(harness: &TestHarness) -> BTreeMap<PartitionRef, String> {
    let mut out = BTreeMap::new();
    for asset in ["raw_flights", "cleaned_flights", "daily_metrics"] {
        for day in 1..=3 {
            let record = harness.record(asset, &key(day)).await;
            out.insert(
                PartitionRef::new(asset, key(day)),
                record.input_fingerprint.as_str().to_string(),
            );
        }
    }
    out
}

#[tokio::test]
async fn test_forced_backfill_rebuilds_range_and_dependents() {
    let harness = harness();
    harness.materialize("*", "*").await;
    let before = fingerprints(&harness).await;
    let day3_updated = harness.record("raw_flights", &key(3)).await.updated_at;

    let request = harness
        .backfill_request("raw_flights", &key(1), &key(2))
        .force();
    let work = harness.orchestrator.plan_backfill(&request).await.unwrap();

    assert_eq!(work.len(), 6);
    let counts = work.counts_by_asset();
    assert_eq!(counts.get("raw_flights"), Some(&2));
    assert_eq!(counts.get("cleaned_flights"), Some(&2));
    assert_eq!(counts.get("daily_metrics"), Some(&2));
    assert!(work.items().iter().any(|item| matches!(
        &item.reason,
        StaleReason::UpstreamInvalidated(upstream) if upstream.asset == "raw_flights"
    )));

    // Planning a forced backfill invalidates the plan but keeps its state
    assert_state(&harness, "raw_flights", &key(1), PartitionState::Succeeded).await;
    assert!(harness.record("raw_flights", &key(1)).await.input_fingerprint.is_unknown());

    let report = harness.backfill(&request).await;
    ReportAssertions::new(&report).assert_counts((6, 0, 0, 0, 0));

    // The third day was never touched
    let after = fingerprints(&harness).await;
    for asset in ["raw_flights", "cleaned_flights", "daily_metrics"] {
        let untouched = PartitionRef::new(asset, key(3));
        assert_eq!(before[&untouched], after[&untouched]);
    }
    assert_eq!(
        harness.record("raw_flights", &key(3)).await.updated_at,
        day3_updated
    );

    // Same inputs, same fingerprints
    assert_eq!(before, after);
    assert_up_to_date(&harness, "*", "*").await;
}

#[tokio::test]
async fn test_forced_backfill_with_missing_upstream_leaves_no_pending_rows() {
    let harness = harness();

    let request = harness
        .backfill_request("cleaned_flights", &key(1), &key(1))
        .force();
    let report = harness.backfill(&request).await;

    ReportAssertions::new(&report)
        .assert_blocked_by(
            "cleaned_flights",
            &key(1),
            &PartitionRef::new("raw_flights", key(1)),
        )
        .assert_blocked_by(
            "daily_metrics",
            &key(1),
            &PartitionRef::new("cleaned_flights", key(1)),
        )
        .assert_counts((0, 0, 0, 2, 0))
        .assert_exit_code(1);

    for asset in ["cleaned_flights", "daily_metrics"] {
        assert_state(&harness, asset, &key(1), PartitionState::Missing).await;
    }
    let cleaned = harness.record("cleaned_flights", &key(1)).await;
    assert_eq!(cleaned.blocked_by, Some(PartitionRef::new("raw_flights", key(1))));
}

#[tokio::test]
async fn test_forced_backfill_blocked_partition_keeps_prior_state() {
    let harness = harness();
    harness.materialize("*", "*").await;
    harness.fetcher.set_permanent_failure("flights", "feed offline");

    let request = harness
        .backfill_request("raw_flights", &key(1), &key(1))
        .force();
    let report = harness.backfill(&request).await;

    ReportAssertions::new(&report)
        .assert_failed("raw_flights", &key(1))
        .assert_counts((0, 1, 0, 2, 0));
    assert_state(&harness, "cleaned_flights", &key(1), PartitionState::Succeeded).await;
    assert_state(&harness, "daily_metrics", &key(1), PartitionState::Succeeded).await;

    // Still stale once the source recovers
    let stale = harness.stale("*", &key(1)).await;
    assert!(stale.contains(&PartitionRef::new("cleaned_flights", key(1))));
}

#[tokio::test]
async fn test_forced_backfill_without_propagation() {
    let harness = harness();
    harness.materialize("*", "*").await;

    let request = harness
        .backfill_request("raw_flights", &key(1), &key(3))
        .force()
        .without_propagation();
    let report = harness.backfill(&request).await;

    ReportAssertions::new(&report).assert_counts((3, 0, 0, 0, 0));
    assert!(report.outcomes.keys().all(|p| p.asset == "raw_flights"));

    // Rows did not change, so dependents stay fresh
    assert_up_to_date(&harness, "*", "*").await;
}

#[tokio::test]
async fn test_missing_only_backfill_fills_gaps_in_selection() {
    let harness = harness();
    harness.materialize("*", "2024-03-01").await;

    let request = harness.backfill_request("raw_flights", &key(1), &key(3));
    assert_eq!(request.mode, BackfillMode::MissingOnly);
    let report = harness.backfill(&request).await;

    ReportAssertions::new(&report)
        .assert_succeeded("raw_flights", &key(2))
        .assert_succeeded("raw_flights", &key(3))
        .assert_counts((2, 0, 0, 0, 0));
    assert_state(&harness, "cleaned_flights", &key(2), PartitionState::Missing).await;
}

#[tokio::test]
async fn test_backfill_over_limit_is_rejected_before_invalidation() {
    let mut definition = pipelines::flights_chain();
    definition.settings.backfill_limit = 2;
    let harness = TestHarness::builder(definition)
        .fetcher(StaticFetcher::new().with_source("flights", rows::flights_for_days(&[1, 2, 3])))
        .build();
    harness.materialize("*", "*").await;

    let request = harness
        .backfill_request("raw_flights", &key(1), &key(3))
        .force();
    let err = harness
        .orchestrator
        .backfill(&request, tokio_util::sync::CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        runway_runtime::Error::BackfillTooLarge { ref asset, count: 3, limit: 2 } if asset == "raw_flights"
    ));
    assert!(err.is_config_error());
    for day in 1..=3 {
        assert_state(&harness, "raw_flights", &key(day), PartitionState::Succeeded).await;
    }
}

#[tokio::test]
async fn test_backfill_includes_manual_assets() {
    let definition = pipelines::from_assets(
        r#"
assets:
  - name: raw_flights
    partitions: { type: daily, start_date: 2024-03-01 }
    compute: { type: source, source_id: flights, timestamp_field: flight_date }
  - name: flight_archive
    policy: manual
    compute: { type: union }
    deps:
      - asset: raw_flights
"#,
    );
    let harness = TestHarness::builder(definition)
        .fetcher(StaticFetcher::new().with_source("flights", rows::flights_for_days(&[1, 2, 3])))
        .build();

    let report = harness.materialize("*", "*").await;
    ReportAssertions::new(&report).assert_counts((3, 0, 0, 0, 0));
    assert_state(&harness, "flight_archive", "__all__", PartitionState::Missing).await;

    let request = harness.backfill_request("flight_archive", &key(1), &key(3));
    let report = harness.backfill(&request).await;
    ReportAssertions::new(&report).assert_succeeded("flight_archive", "__all__");

    let record = harness.record("flight_archive", "__all__").await;
    assert_eq!(record.row_count, Some(9));
}
