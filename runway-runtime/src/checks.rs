//! Built-in data quality checks
//!
//! Checks run against the rows a unit just committed. Rows are converted to a
//! columnar [`AssetOutput`] first.
//!
//! # Null Handling
//!
//! When building `AssetOutput` from rows, missing fields are normalized to `Value::Null`:
//! - `not_null` counts nulls (including missing fields) as failures
//! - `null_rate` compares the null fraction against its threshold
//! - `unique` treats null as a distinct value
//! - `in_range` and `regex` skip null values (only validate non-null)
//! - `accepted_values` skips nulls
//! - `freshness` ignores nulls and fails when no timestamp parses

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use runway_core::{
    AssetGraph, CheckType, DataQualityResult, PartitionKey, QualityCheck, ReadError, Row,
    StorageReader,
};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::quality_gate::{CheckRunner, MaterializedOutput};

/// Maximum number of failed samples to include in results
const MAX_FAILED_SAMPLES: usize = 10;

/// Columnar view of a partition's rows
#[derive(Debug, Clone, Default)]
pub struct AssetOutput {
    /// Column name -> column values (one per row)
    pub columns: HashMap<String, Vec<Value>>,
    pub row_count: usize,
}

impl AssetOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from rows, padding missing fields with `Null` so every column has
    /// `row_count` values
    pub fn from_rows(rows: &[Row]) -> Self {
        let row_count = rows.len();
        if row_count == 0 {
            return Self::empty();
        }

        let all_columns: BTreeSet<&String> = rows.iter().flat_map(|row| row.keys()).collect();
        let columns = all_columns
            .into_iter()
            .map(|name| {
                let values = rows
                    .iter()
                    .map(|row| row.get(name).cloned().unwrap_or(Value::Null))
                    .collect();
                (name.clone(), values)
            })
            .collect();

        Self { columns, row_count }
    }

    pub fn get_column(&self, name: &str) -> Option<&Vec<Value>> {
        self.columns.get(name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }
}

/// Outcome of one validation before it is attached to a check
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub passed: bool,
    pub failed_count: Option<i64>,
    pub total_count: Option<i64>,
    pub error_message: Option<String>,
    pub failed_samples: Option<Value>,
    /// Set when the check could not execute at all
    pub errored: bool,
}

impl ValidationResult {
    pub fn passed(total_count: i64) -> Self {
        Self {
            passed: true,
            failed_count: Some(0),
            total_count: Some(total_count),
            error_message: None,
            failed_samples: None,
            errored: false,
        }
    }

    pub fn failed(failed_count: i64, total_count: i64, message: String) -> Self {
        Self {
            passed: false,
            failed_count: Some(failed_count),
            total_count: Some(total_count),
            error_message: Some(message),
            failed_samples: None,
            errored: false,
        }
    }

    pub fn failed_with_samples(
        failed_count: i64,
        total_count: i64,
        message: String,
        samples: Vec<Value>,
    ) -> Self {
        Self {
            failed_samples: Some(Value::Array(samples)),
            ..Self::failed(failed_count, total_count, message)
        }
    }

    /// The check could not execute
    pub fn error(message: String) -> Self {
        Self {
            passed: false,
            failed_count: None,
            total_count: None,
            error_message: Some(message),
            failed_samples: None,
            errored: true,
        }
    }

    fn into_result(self, check: &QualityCheck, duration_ms: i64) -> DataQualityResult {
        let message = self.error_message.unwrap_or_default();
        let mut result = if self.passed {
            DataQualityResult::passed(check)
        } else if self.errored {
            DataQualityResult::error(check, message)
        } else {
            DataQualityResult::failed(check, message)
        };

        if let (Some(failed), Some(total)) = (self.failed_count, self.total_count) {
            result = result.with_row_counts(failed, total);
        }
        if let Some(samples) = self.failed_samples {
            result = result.with_diagnostics(serde_json::json!({ "failed_samples": samples }));
        }
        result.with_duration_ms(duration_ms)
    }
}

/// Validate rows against a check that needs no external data
pub fn validate(check_type: &CheckType, data: &AssetOutput, now: DateTime<Utc>) -> ValidationResult {
    match check_type {
        CheckType::NotNull { columns } => validate_not_null(columns, data),
        CheckType::NullRate { column, max_rate } => validate_null_rate(column, *max_rate, data),
        CheckType::Unique { columns } => validate_unique(columns, data),
        CheckType::InRange { column, min, max } => validate_in_range(column, *min, *max, data),
        CheckType::Regex { column, pattern } => validate_regex(column, pattern, data),
        CheckType::RowCount { min, max } => validate_row_count(*min, *max, data),
        CheckType::Freshness {
            timestamp_column,
            max_age_seconds,
        } => validate_freshness(timestamp_column, *max_age_seconds, data, now),
        CheckType::AcceptedValues { column, values } => {
            validate_accepted_values(column, values, data)
        }
        CheckType::SchemaMatch {
            expected_columns,
            allow_extra_columns,
        } => validate_schema_match(expected_columns, *allow_extra_columns, data),
        CheckType::ReferentialIntegrity { .. } => ValidationResult::error(
            "Referential integrity requires reference data".to_string(),
        ),
    }
}

fn missing_column(column: &str) -> ValidationResult {
    ValidationResult::error(format!("output has no column {}", column))
}

/// Offending rows collected by a row-level check; keeps the first
/// [`MAX_FAILED_SAMPLES`] as diagnostics
struct Violations {
    count: i64,
    samples: Vec<Value>,
}

impl Violations {
    fn new() -> Self {
        Self {
            count: 0,
            samples: Vec::new(),
        }
    }

    fn add(&mut self, sample: impl FnOnce() -> Value) {
        self.count += 1;
        if self.samples.len() < MAX_FAILED_SAMPLES {
            self.samples.push(sample());
        }
    }

    fn into_result(self, total: i64, summary: impl FnOnce(i64) -> String) -> ValidationResult {
        if self.count == 0 {
            ValidationResult::passed(total)
        } else {
            let message = summary(self.count);
            ValidationResult::failed_with_samples(self.count, total, message, self.samples)
        }
    }
}

fn validate_not_null(columns: &[String], data: &AssetOutput) -> ValidationResult {
    let total = data.row_count as i64;
    let mut violations = Violations::new();

    for column in columns {
        let Some(values) = data.get_column(column) else {
            // Missing from every row is all-null unless there are no rows
            if total == 0 {
                continue;
            }
            return missing_column(column);
        };
        for (row, value) in values.iter().enumerate() {
            if value.is_null() {
                violations.add(|| serde_json::json!({ "row": row, "column": column }));
            }
        }
    }

    violations.into_result(total, |nulls| {
        format!("{} of {} rows have a null in {}", nulls, total, columns.join(", "))
    })
}

fn validate_null_rate(column: &str, max_rate: f64, data: &AssetOutput) -> ValidationResult {
    let total = data.row_count as i64;
    if total == 0 {
        return ValidationResult::passed(0);
    }
    let Some(values) = data.get_column(column) else {
        return missing_column(column);
    };

    let nulls = values.iter().filter(|v| v.is_null()).count() as i64;
    let rate = nulls as f64 / total as f64;
    if rate <= max_rate {
        ValidationResult::passed(total)
    } else {
        ValidationResult::failed(
            nulls,
            total,
            format!(
                "Null rate {:.4} in column '{}' exceeds {:.4}",
                rate, column, max_rate
            ),
        )
    }
}

fn validate_unique(columns: &[String], data: &AssetOutput) -> ValidationResult {
    if columns.is_empty() {
        return ValidationResult::error("unique needs at least one column".to_string());
    }
    let total = data.row_count as i64;
    if total == 0 {
        return ValidationResult::passed(0);
    }

    let mut key_columns = Vec::with_capacity(columns.len());
    for column in columns {
        match data.get_column(column) {
            Some(values) => key_columns.push(values),
            None => return missing_column(column),
        }
    }

    // First row holding each key, so samples point at both copies
    let mut first_seen: HashMap<Vec<String>, usize> = HashMap::new();
    let mut violations = Violations::new();
    for row in 0..data.row_count {
        let key: Vec<String> = key_columns
            .iter()
            .map(|values| values[row].to_string())
            .collect();
        let first = *first_seen.entry(key.clone()).or_insert(row);
        if first != row {
            violations.add(|| serde_json::json!({ "row": row, "same_as_row": first, "key": key }));
        }
    }

    violations.into_result(total, |dupes| {
        format!("{} rows repeat an earlier ({}) key", dupes, columns.join(", "))
    })
}

fn validate_in_range(
    column: &str,
    min: Option<f64>,
    max: Option<f64>,
    data: &AssetOutput,
) -> ValidationResult {
    let total = data.row_count as i64;
    if total == 0 {
        return ValidationResult::passed(0);
    }
    let Some(values) = data.get_column(column) else {
        return missing_column(column);
    };

    let mut violations = Violations::new();
    for (row, value) in values.iter().enumerate() {
        if value.is_null() {
            continue;
        }
        let inside = value
            .as_f64()
            .is_some_and(|n| min.map_or(true, |m| n >= m) && max.map_or(true, |m| n <= m));
        if !inside {
            violations.add(|| serde_json::json!({ "row": row, "value": value }));
        }
    }

    let bounds = match (min, max) {
        (Some(min), Some(max)) => format!("[{}, {}]", min, max),
        (Some(min), None) => format!(">= {}", min),
        (None, Some(max)) => format!("<= {}", max),
        (None, None) => "any number".to_string(),
    };
    violations.into_result(total, |outside| {
        format!("{}: {} of {} values are not {}", column, outside, total, bounds)
    })
}

fn validate_regex(column: &str, pattern: &str, data: &AssetOutput) -> ValidationResult {
    let regex = match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(e) => return ValidationResult::error(format!("bad pattern /{}/: {}", pattern, e)),
    };
    let total = data.row_count as i64;
    if total == 0 {
        return ValidationResult::passed(0);
    }
    let Some(values) = data.get_column(column) else {
        return missing_column(column);
    };

    let mut violations = Violations::new();
    for (row, value) in values.iter().enumerate() {
        let matched = match value {
            Value::Null => continue,
            Value::String(s) => regex.is_match(s),
            _ => false,
        };
        if !matched {
            violations.add(|| serde_json::json!({ "row": row, "value": value }));
        }
    }

    violations.into_result(total, |misses| {
        format!("{}: {} of {} values do not match /{}/", column, misses, total, pattern)
    })
}

fn validate_row_count(min: Option<i64>, max: Option<i64>, data: &AssetOutput) -> ValidationResult {
    let count = data.row_count as i64;

    match (min, max) {
        (Some(min), _) if count < min => ValidationResult::failed(
            0,
            count,
            format!("Row count {} is below minimum {}", count, min),
        ),
        (_, Some(max)) if count > max => ValidationResult::failed(
            0,
            count,
            format!("Row count {} exceeds maximum {}", count, max),
        ),
        _ => ValidationResult::passed(count),
    }
}

fn validate_freshness(
    column: &str,
    max_age_seconds: u64,
    data: &AssetOutput,
    now: DateTime<Utc>,
) -> ValidationResult {
    let total = data.row_count as i64;
    let Some(values) = data.get_column(column) else {
        return if total == 0 {
            ValidationResult::failed(0, 0, "No rows to establish freshness".to_string())
        } else {
            missing_column(column)
        };
    };

    let Some(newest) = values.iter().filter_map(parse_timestamp).max() else {
        return ValidationResult::failed(
            total,
            total,
            format!("No parseable timestamps in column '{}'", column),
        );
    };

    let age = now.signed_duration_since(newest).num_seconds();
    if age <= max_age_seconds as i64 {
        ValidationResult::passed(total)
    } else {
        ValidationResult::failed(
            0,
            total,
            format!(
                "Newest value in '{}' is {}s old, exceeding {}s",
                column, age, max_age_seconds
            ),
        )
    }
}

fn validate_accepted_values(
    column: &str,
    accepted: &[Value],
    data: &AssetOutput,
) -> ValidationResult {
    let total = data.row_count as i64;
    if total == 0 {
        return ValidationResult::passed(0);
    }
    let Some(values) = data.get_column(column) else {
        return missing_column(column);
    };

    let mut violations = Violations::new();
    for (row, value) in values.iter().enumerate() {
        if !value.is_null() && !accepted.contains(value) {
            violations.add(|| serde_json::json!({ "row": row, "value": value }));
        }
    }

    violations.into_result(total, |rejected| {
        format!(
            "{}: {} of {} values are outside the {} accepted",
            column,
            rejected,
            total,
            accepted.len()
        )
    })
}

/// Validate that every value in `column` exists in `reference`
pub fn validate_referential_integrity(
    column: &str,
    reference: &HashSet<String>,
    reference_asset: &str,
    data: &AssetOutput,
) -> ValidationResult {
    let total = data.row_count as i64;
    if total == 0 {
        return ValidationResult::passed(0);
    }
    let Some(values) = data.get_column(column) else {
        return missing_column(column);
    };

    let mut violations = Violations::new();
    for (row, value) in values.iter().enumerate() {
        if !value.is_null() && !reference.contains(&value.to_string()) {
            violations.add(|| serde_json::json!({ "row": row, "value": value }));
        }
    }

    violations.into_result(total, |orphans| {
        format!(
            "{}: {} of {} values have no row in {}",
            column, orphans, total, reference_asset
        )
    })
}

fn validate_schema_match(
    expected_columns: &[String],
    allow_extra_columns: bool,
    data: &AssetOutput,
) -> ValidationResult {
    let total = data.row_count as i64;
    // An empty partition carries no schema to compare
    if total == 0 {
        return ValidationResult::passed(0);
    }

    let expected: BTreeSet<&str> = expected_columns.iter().map(String::as_str).collect();
    let actual: BTreeSet<&str> = data.columns.keys().map(String::as_str).collect();

    let missing: Vec<&str> = expected.difference(&actual).copied().collect();
    let extra: Vec<&str> = if allow_extra_columns {
        Vec::new()
    } else {
        actual.difference(&expected).copied().collect()
    };

    if missing.is_empty() && extra.is_empty() {
        return ValidationResult::passed(total);
    }

    let mut result = ValidationResult::failed(
        0,
        total,
        format!(
            "Schema mismatch: missing columns {:?}, unexpected columns {:?}",
            missing, extra
        ),
    );
    result.failed_samples = Some(serde_json::json!({
        "missing_columns": missing,
        "extra_columns": extra
    }));
    result
}

/// Parse an RFC 3339 timestamp, `YYYY-MM-DD HH:MM:SS`, a plain date, or epoch seconds
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                    .ok()
                    .map(|naive| naive.and_utc())
            })
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

/// Runs the built-in check types.
///
/// Referential checks read the reference asset through the storage reader:
/// the unpartitioned key for unpartitioned dimensions, the same key otherwise.
pub struct BuiltinCheckRunner {
    reader: Arc<dyn StorageReader>,
    graph: Arc<AssetGraph>,
}

impl BuiltinCheckRunner {
    pub fn new(reader: Arc<dyn StorageReader>, graph: Arc<AssetGraph>) -> Self {
        Self { reader, graph }
    }

    async fn reference_values(
        &self,
        reference_asset: &str,
        reference_column: &str,
        key: &PartitionKey,
    ) -> Result<HashSet<String>, String> {
        let node = self
            .graph
            .node(reference_asset)
            .map_err(|e| e.to_string())?;
        let reference_key = if node.partitions.is_partitioned() {
            key.clone()
        } else {
            PartitionKey::unpartitioned()
        };

        let rows = self
            .reader
            .read(reference_asset, &reference_key)
            .await
            .map_err(|e| match e {
                ReadError::NotFound { .. } => format!(
                    "Reference asset {}[{}] has no committed data",
                    reference_asset, reference_key
                ),
                other => other.to_string(),
            })?;

        Ok(rows
            .iter()
            .filter_map(|row| row.get(reference_column))
            .filter(|v| !v.is_null())
            .map(|v| v.to_string())
            .collect())
    }
}

#[async_trait]
impl CheckRunner for BuiltinCheckRunner {
    async fn run(&self, check: &QualityCheck, output: &MaterializedOutput) -> DataQualityResult {
        let started = Instant::now();
        let data = AssetOutput::from_rows(&output.rows);

        let validation = match &check.check_type {
            CheckType::ReferentialIntegrity {
                column,
                reference_asset,
                reference_column,
            } => match self
                .reference_values(reference_asset, reference_column, &output.partition.key)
                .await
            {
                Ok(reference) => {
                    validate_referential_integrity(column, &reference, reference_asset, &data)
                }
                Err(message) => {
                    warn!(check_id = %check.id, error = %message, "Reference data unavailable");
                    ValidationResult::error(message)
                }
            },
            other => validate(other, &data, Utc::now()),
        };

        debug!(
            check_id = %check.id,
            check_type = check.check_type.type_name(),
            passed = validation.passed,
            "Check evaluated"
        );

        validation.into_result(check, started.elapsed().as_millis() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use runway_core::{AssetNode, CheckOutcome, PartitionRef, StorageWriter};
    use runway_storage::MemoryStore;
    use serde_json::json;

    fn rows(values: Vec<Value>) -> Vec<Row> {
        values
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect()
    }

    fn flights() -> AssetOutput {
        AssetOutput::from_rows(&rows(vec![
            json!({"flight_id": "AA1", "airline_iata_code": "AA", "delay_minutes": 5}),
            json!({"flight_id": "UA2", "airline_iata_code": "UA", "delay_minutes": 400}),
            json!({"flight_id": "DL3", "delay_minutes": null}),
        ]))
    }

    #[test]
    fn test_from_rows_pads_missing_fields() {
        let data = flights();
        assert_eq!(data.row_count, 3);
        assert_eq!(data.get_column("airline_iata_code").unwrap().len(), 3);
        assert!(data.get_column("airline_iata_code").unwrap()[2].is_null());
    }

    #[test]
    fn test_not_null() {
        let result = validate_not_null(&["airline_iata_code".to_string()], &flights());
        assert!(!result.passed);
        assert_eq!(result.failed_count, Some(1));

        let result = validate_not_null(&["flight_id".to_string()], &flights());
        assert!(result.passed);

        let result = validate_not_null(&["nope".to_string()], &flights());
        assert!(result.errored);
    }

    #[test]
    fn test_null_rate() {
        assert!(validate_null_rate("airline_iata_code", 0.5, &flights()).passed);
        assert!(!validate_null_rate("airline_iata_code", 0.1, &flights()).passed);
    }

    #[test]
    fn test_unique() {
        assert!(validate_unique(&["flight_id".to_string()], &flights()).passed);
        let dupes = AssetOutput::from_rows(&rows(vec![json!({"id": 1}), json!({"id": 1})]));
        let result = validate_unique(&["id".to_string()], &dupes);
        assert_eq!(result.failed_count, Some(1));
    }

    #[test]
    fn test_unique_samples_point_at_first_copy() {
        let mut values: Vec<Value> = (0..3).map(|i| json!({"id": i})).collect();
        values.extend((0..15).map(|_| json!({"id": 1})));
        let data = AssetOutput::from_rows(&rows(values));

        let result = validate_unique(&["id".to_string()], &data);
        assert_eq!(result.failed_count, Some(15));
        let samples = result.failed_samples.unwrap();
        let samples = samples.as_array().unwrap();
        assert_eq!(samples.len(), MAX_FAILED_SAMPLES);
        assert_eq!(samples[0]["row"], json!(3));
        assert_eq!(samples[0]["same_as_row"], json!(1));
    }

    #[test]
    fn test_in_range_skips_nulls() {
        let result = validate_in_range("delay_minutes", Some(-60.0), Some(300.0), &flights());
        assert!(!result.passed);
        assert_eq!(result.failed_count, Some(1));
    }

    #[test]
    fn test_regex() {
        assert!(validate_regex("flight_id", "^[A-Z]{2}[0-9]+$", &flights()).passed);
        assert!(validate_regex("flight_id", "(", &flights()).errored);
    }

    #[test]
    fn test_row_count() {
        assert!(validate_row_count(Some(1), None, &flights()).passed);
        assert!(!validate_row_count(Some(1), None, &AssetOutput::empty()).passed);
        assert!(!validate_row_count(None, Some(2), &flights()).passed);
    }

    #[test]
    fn test_freshness() {
        let data = AssetOutput::from_rows(&rows(vec![
            json!({"ts": "2024-03-01T10:00:00Z"}),
            json!({"ts": "2024-03-01T12:00:00Z"}),
        ]));
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap();
        assert!(validate_freshness("ts", 7200, &data, now).passed);
        assert!(!validate_freshness("ts", 1800, &data, now).passed);
    }

    #[test]
    fn test_accepted_values() {
        let accepted = vec![json!("AA"), json!("UA")];
        assert!(validate_accepted_values("airline_iata_code", &accepted, &flights()).passed);
        let accepted = vec![json!("AA")];
        assert!(!validate_accepted_values("airline_iata_code", &accepted, &flights()).passed);
    }

    #[test]
    fn test_schema_match() {
        let expected = vec!["flight_id".to_string(), "delay_minutes".to_string()];
        assert!(validate_schema_match(&expected, true, &flights()).passed);
        assert!(!validate_schema_match(&expected, false, &flights()).passed);

        let expected = vec!["flight_id".to_string(), "tail_number".to_string()];
        assert!(!validate_schema_match(&expected, true, &flights()).passed);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp(&json!("2024-03-01T10:00:00Z")).is_some());
        assert!(parse_timestamp(&json!("2024-03-01 10:00:00")).is_some());
        assert!(parse_timestamp(&json!("2024-03-01")).is_some());
        assert!(parse_timestamp(&json!(1709287200)).is_some());
        assert!(parse_timestamp(&json!("yesterday")).is_none());
    }

    #[tokio::test]
    async fn test_referential_integrity_reads_reference_asset() {
        let store = MemoryStore::new();
        store
            .upsert(
                "airlines",
                &PartitionKey::unpartitioned(),
                &rows(vec![json!({"iata": "AA"}), json!({"iata": "DL"})]),
            )
            .await
            .unwrap();

        let mut graph = AssetGraph::new();
        graph.register(AssetNode::new("airlines")).unwrap();
        let runner = BuiltinCheckRunner::new(Arc::new(store), Arc::new(graph));

        let check = QualityCheck::new(
            "airline_exists",
            "cleaned_flights",
            CheckType::ReferentialIntegrity {
                column: "airline_iata_code".to_string(),
                reference_asset: "airlines".to_string(),
                reference_column: "iata".to_string(),
            },
        );
        let output = MaterializedOutput::new(
            PartitionRef::new("cleaned_flights", "2024-03-01"),
            rows(vec![
                json!({"airline_iata_code": "AA"}),
                json!({"airline_iata_code": "UA"}),
            ]),
        );

        let result = runner.run(&check, &output).await;
        assert_eq!(result.outcome, CheckOutcome::Failed);
        assert_eq!(result.failed_row_count, Some(1));
    }

    #[tokio::test]
    async fn test_missing_reference_is_error() {
        let mut graph = AssetGraph::new();
        graph.register(AssetNode::new("airlines")).unwrap();
        let runner = BuiltinCheckRunner::new(Arc::new(MemoryStore::new()), Arc::new(graph));
        let check = QualityCheck::new(
            "airline_exists",
            "cleaned_flights",
            CheckType::ReferentialIntegrity {
                column: "airline_iata_code".to_string(),
                reference_asset: "airlines".to_string(),
                reference_column: "iata".to_string(),
            },
        );
        let output = MaterializedOutput::new(
            PartitionRef::new("cleaned_flights", "2024-03-01"),
            rows(vec![json!({"airline_iata_code": "AA"})]),
        );

        let result = runner.run(&check, &output).await;
        assert_eq!(result.outcome, CheckOutcome::Error);
    }
}
