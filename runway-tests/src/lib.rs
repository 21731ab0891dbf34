//! Shared test utilities for Runway crates
//!
//! This crate provides:
//! - **Fixtures**: Pre-built pipelines and rows for the flights domain
//! - **Builders**: A harness wiring an orchestrator to in-memory collaborators
//! - **Mocks**: Sources, computes and writers with failure injection
//! - **Assertions**: Helpers for run reports and catalog state
//!
//! # Example
//!
//! ```ignore
//! use runway_tests::{fixtures, mocks::StaticFetcher, ReportAssertions, TestHarness};
//!
//! #[tokio::test]
//! async fn test_chain() {
//!     let harness = TestHarness::builder(fixtures::pipelines::flights_chain())
//!         .fetcher(StaticFetcher::new().with_source("flights", fixtures::rows::flights_for_days(&[1])))
//!         .build();
//!
//!     let report = harness.materialize("*", "2024-03-01").await;
//!     ReportAssertions::new(&report).assert_counts((3, 0, 0, 0, 0));
//! }
//! ```

pub mod assertions;
pub mod builders;
pub mod fixtures;
pub mod mocks;

// Re-export commonly used items
pub use assertions::ReportAssertions;
pub use builders::{HarnessBuilder, TestHarness};
pub use fixtures::{dates, pipelines, rows};
pub use mocks::{CallLog, Failure, FlakyWriter, ScriptedCompute, StaticFetcher};
