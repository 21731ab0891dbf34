//! Data quality check definitions and results
//!
//! Checks run against freshly materialized output before a partition becomes
//! usable downstream. A failing `blocking` check quarantines the partition;
//! `advisory` failures are recorded and logged but do not stop propagation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a data quality check, unique within a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckId(pub String);

impl CheckId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CheckId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CheckId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

fn default_true() -> bool {
    true
}

/// Types of data quality checks that can be applied to assets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckType {
    /// Column(s) cannot contain null values
    NotNull {
        /// Columns to check for nulls
        columns: Vec<String>,
    },

    /// Fraction of null values in a column must not exceed a threshold
    NullRate {
        column: String,
        /// Maximum allowed null fraction in `[0, 1]`
        max_rate: f64,
    },

    /// Column values must be unique (no duplicates)
    Unique {
        /// Columns that together must be unique
        columns: Vec<String>,
    },

    /// Numeric column values must be within a specified range
    InRange {
        /// Column to check
        column: String,
        /// Minimum value (inclusive), if any
        #[serde(default)]
        min: Option<f64>,
        /// Maximum value (inclusive), if any
        #[serde(default)]
        max: Option<f64>,
    },

    /// String column values must match a regular expression
    Regex {
        /// Column to check
        column: String,
        /// Regular expression pattern
        pattern: String,
    },

    /// Row count must be within specified bounds
    RowCount {
        /// Minimum row count (inclusive), if any
        #[serde(default)]
        min: Option<i64>,
        /// Maximum row count (inclusive), if any
        #[serde(default)]
        max: Option<i64>,
    },

    /// Newest timestamp in a column must be within a time window of now
    Freshness {
        /// Column containing RFC 3339 timestamps or `YYYY-MM-DD` dates
        timestamp_column: String,
        /// Maximum age in seconds
        max_age_seconds: u64,
    },

    /// Column values must be one of a predefined set
    AcceptedValues {
        /// Column to check
        column: String,
        /// Set of allowed values
        values: Vec<serde_json::Value>,
    },

    /// All values in a column must exist in a column of another asset
    ReferentialIntegrity {
        /// Column to check
        column: String,
        /// Dimension asset holding the reference values
        reference_asset: String,
        /// Column in the reference asset
        reference_column: String,
    },

    /// Schema must match expected structure
    SchemaMatch {
        /// Expected column names
        expected_columns: Vec<String>,
        /// Whether to allow additional columns not in the expected list
        #[serde(default = "default_true")]
        allow_extra_columns: bool,
    },
}

impl CheckType {
    /// Get the check type name for metrics and logging
    pub fn type_name(&self) -> &'static str {
        match self {
            CheckType::NotNull { .. } => "not_null",
            CheckType::NullRate { .. } => "null_rate",
            CheckType::Unique { .. } => "unique",
            CheckType::InRange { .. } => "in_range",
            CheckType::Regex { .. } => "regex",
            CheckType::RowCount { .. } => "row_count",
            CheckType::Freshness { .. } => "freshness",
            CheckType::AcceptedValues { .. } => "accepted_values",
            CheckType::ReferentialIntegrity { .. } => "referential_integrity",
            CheckType::SchemaMatch { .. } => "schema_match",
        }
    }

    /// Asset this check reads besides the one it validates
    pub fn referenced_asset(&self) -> Option<&str> {
        match self {
            CheckType::ReferentialIntegrity {
                reference_asset, ..
            } => Some(reference_asset),
            _ => None,
        }
    }
}

/// Whether a failing check stops propagation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckSeverity {
    /// Failure quarantines the partition
    #[default]
    Blocking,

    /// Failure is recorded and logged as a warning
    Advisory,
}

impl CheckSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckSeverity::Blocking => "blocking",
            CheckSeverity::Advisory => "advisory",
        }
    }
}

impl fmt::Display for CheckSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a check execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    /// Data meets quality criteria
    Passed,

    /// Data does not meet quality criteria
    Failed,

    /// The check itself could not execute (missing column, bad pattern)
    Error,
}

impl CheckOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CheckOutcome::Passed)
    }

    /// Failed or errored
    pub fn is_failure(&self) -> bool {
        matches!(self, CheckOutcome::Failed | CheckOutcome::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckOutcome::Passed => "passed",
            CheckOutcome::Failed => "failed",
            CheckOutcome::Error => "error",
        }
    }
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definition of a data quality check attached to an asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityCheck {
    pub id: CheckId,

    /// Asset this check validates
    pub asset: String,

    pub check_type: CheckType,

    pub severity: CheckSeverity,

    pub description: Option<String>,

    /// Disabled checks are skipped by the gate
    pub enabled: bool,
}

impl QualityCheck {
    /// Create an enabled, blocking check
    pub fn new(id: impl Into<CheckId>, asset: impl Into<String>, check_type: CheckType) -> Self {
        Self {
            id: id.into(),
            asset: asset.into(),
            check_type,
            severity: CheckSeverity::Blocking,
            description: None,
            enabled: true,
        }
    }

    pub fn severity(mut self, severity: CheckSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn advisory(self) -> Self {
        self.severity(CheckSeverity::Advisory)
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Result of executing one check against one materialized partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQualityResult {
    pub check_id: CheckId,

    /// Severity copied from the check definition
    pub severity: CheckSeverity,

    pub outcome: CheckOutcome,

    /// Human-readable explanation for failures and errors
    pub message: Option<String>,

    /// Number of rows that failed the check (if applicable)
    pub failed_row_count: Option<i64>,

    /// Total number of rows checked (if applicable)
    pub total_row_count: Option<i64>,

    /// Sample of failing rows or other check-specific detail
    #[serde(default)]
    pub diagnostics: serde_json::Value,

    pub duration_ms: i64,

    pub executed_at: DateTime<Utc>,
}

impl DataQualityResult {
    fn base(check: &QualityCheck, outcome: CheckOutcome) -> Self {
        Self {
            check_id: check.id.clone(),
            severity: check.severity,
            outcome,
            message: None,
            failed_row_count: None,
            total_row_count: None,
            diagnostics: serde_json::Value::Null,
            duration_ms: 0,
            executed_at: Utc::now(),
        }
    }

    /// Create a passed check result
    pub fn passed(check: &QualityCheck) -> Self {
        Self::base(check, CheckOutcome::Passed)
    }

    /// Create a failed check result
    pub fn failed(check: &QualityCheck, message: impl Into<String>) -> Self {
        let mut result = Self::base(check, CheckOutcome::Failed);
        result.message = Some(message.into());
        result
    }

    /// Create an error check result (check itself failed to execute)
    pub fn error(check: &QualityCheck, message: impl Into<String>) -> Self {
        let mut result = Self::base(check, CheckOutcome::Error);
        result.message = Some(message.into());
        result
    }

    /// Set the row counts for this result
    pub fn with_row_counts(mut self, failed: i64, total: i64) -> Self {
        self.failed_row_count = Some(failed);
        self.total_row_count = Some(total);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: serde_json::Value) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Returns true if this result should quarantine the partition
    pub fn is_blocking_failure(&self) -> bool {
        self.severity == CheckSeverity::Blocking && self.outcome.is_failure()
    }

    /// Calculate failure rate as a percentage
    pub fn failure_rate(&self) -> Option<f64> {
        match (self.failed_row_count, self.total_row_count) {
            (Some(failed), Some(total)) if total > 0 => {
                Some((failed as f64 / total as f64) * 100.0)
            }
            _ => None,
        }
    }
}

/// Summary of a gate evaluation for one partition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualitySummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub has_blocking_failures: bool,
}

impl QualitySummary {
    pub fn from_results(results: &[DataQualityResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            summary.total += 1;
            match result.outcome {
                CheckOutcome::Passed => summary.passed += 1,
                CheckOutcome::Failed => summary.failed += 1,
                CheckOutcome::Error => summary.errors += 1,
            }
            if result.is_blocking_failure() {
                summary.has_blocking_failures = true;
            }
        }
        summary
    }
}
