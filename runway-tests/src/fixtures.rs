//! Test data factories for Runway types
//!
//! Provides pre-built pipelines and rows with sensible defaults.
//! Use these for quick test setup without needing to specify every field.

use chrono::NaiveDate;
use runway_core::{PipelineConfig, PipelineDefinition, Row};
use serde_json::{json, Value};

/// Calendar helpers
pub mod dates {
    use super::*;

    /// First day of every fixture pipeline
    pub fn start() -> NaiveDate {
        march(1)
    }

    /// A day in March 2024
    pub fn march(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap_or_else(|| panic!("invalid day {}", day))
    }

    /// Partition key of a day in March 2024
    pub fn key(day: u32) -> String {
        march(day).format("%Y-%m-%d").to_string()
    }
}

/// Pipeline definition factories
pub mod pipelines {
    use super::*;

    const SETTINGS: &str = r#"
settings:
  concurrency: 4
  catalog: { type: memory }
  retry:
    max_attempts: 3
    initial_delay_ms: 1
    max_delay_ms: 5
"#;

    /// Parse a pipeline from YAML assets, using fast test settings
    pub fn from_assets(assets_yaml: &str) -> PipelineDefinition {
        let yaml = format!("{}\n{}", SETTINGS, assets_yaml);
        PipelineConfig::from_yaml_str(&yaml)
            .and_then(PipelineConfig::build)
            .unwrap_or_else(|e| panic!("invalid fixture pipeline: {}", e))
    }

    /// `raw_flights -> cleaned_flights -> daily_metrics`, daily from 2024-03-01
    pub fn flights_chain() -> PipelineDefinition {
        from_assets(
            r#"
assets:
  - name: raw_flights
    group: raw
    partitions: { type: daily, start_date: 2024-03-01 }
    compute: { type: source, source_id: flights, timestamp_field: flight_date }
  - name: cleaned_flights
    group: cleaned
    partitions: { type: daily, start_date: 2024-03-01 }
    compute:
      type: filter
      column: status
      exclude_values: [cancelled]
    checks:
      - id: no_null_airline_code
        type: not_null
        columns: [airline_iata_code]
    deps:
      - asset: raw_flights
  - name: daily_metrics
    group: metrics
    partitions: { type: daily, start_date: 2024-03-01 }
    compute:
      type: rollup
      group_by: [airline_iata_code]
      aggregates:
        - { function: count, as: flights }
        - { column: departure_delay_minutes, function: avg, as: avg_delay_minutes }
    deps:
      - asset: cleaned_flights
"#,
        )
    }

    /// Two independent branches:
    /// `raw_flights -> cleaned_flights -> daily_metrics` and
    /// `raw_weather -> weather_summary`
    pub fn two_branches() -> PipelineDefinition {
        from_assets(
            r#"
assets:
  - name: raw_flights
    group: raw
    partitions: { type: daily, start_date: 2024-03-01 }
    compute: { type: source, source_id: flights, timestamp_field: flight_date }
  - name: cleaned_flights
    group: cleaned
    partitions: { type: daily, start_date: 2024-03-01 }
    compute: { type: filter, column: status, exclude_values: [cancelled] }
    deps:
      - asset: raw_flights
  - name: daily_metrics
    group: metrics
    partitions: { type: daily, start_date: 2024-03-01 }
    compute:
      type: rollup
      group_by: [airline_iata_code]
      aggregates:
        - { function: count, as: flights }
    deps:
      - asset: cleaned_flights
  - name: raw_weather
    group: raw
    partitions: { type: daily, start_date: 2024-03-01 }
    compute: { type: source, source_id: weather, timestamp_field: observed_at }
  - name: weather_summary
    group: metrics
    partitions: { type: daily, start_date: 2024-03-01 }
    compute:
      type: rollup
      group_by: [airport_iata_code]
      aggregates:
        - { column: wind_speed_kt, function: max, as: max_wind_kt }
    deps:
      - asset: raw_weather
"#,
        )
    }

    /// Flights enriched with an unpartitioned airport table, plus an
    /// unpartitioned summary over every enriched day
    pub fn enriched() -> PipelineDefinition {
        from_assets(
            r#"
assets:
  - name: airports
    group: raw
    compute: { type: source, source_id: airports }
  - name: raw_flights
    group: raw
    partitions: { type: daily, start_date: 2024-03-01 }
    compute: { type: source, source_id: flights, timestamp_field: flight_date }
  - name: enriched_flights
    group: enriched
    partitions: { type: daily, start_date: 2024-03-01 }
    compute: { type: join, right: airports, on: [airport_iata_code] }
    checks:
      - id: known_airports
        type: referential_integrity
        column: airport_iata_code
        reference_asset: airports
        reference_column: airport_iata_code
    deps:
      - asset: raw_flights
      - asset: airports
  - name: flight_summary
    group: metrics
    policy: on_upstream_change
    compute:
      type: rollup
      group_by: [airline_iata_code]
      aggregates:
        - { function: count, as: flights }
    deps:
      - asset: enriched_flights
"#,
        )
    }
}

/// Row factories
pub mod rows {
    use super::*;

    fn object(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture row is not an object: {}", other),
        }
    }

    /// One flight record
    pub fn flight(id: &str, date: &str, airline: &str, status: &str, delay: i64) -> Row {
        object(json!({
            "flight_id": id,
            "flight_date": date,
            "airline_iata_code": airline,
            "airport_iata_code": "LHR",
            "status": status,
            "departure_delay_minutes": delay,
        }))
    }

    /// Three flights per day for each of the given days, one of them cancelled
    pub fn flights_for_days(days: &[u32]) -> Vec<Row> {
        days.iter()
            .flat_map(|day| {
                let date = dates::key(*day);
                vec![
                    flight(&format!("BA117-{}", day), &date, "BA", "landed", 12),
                    flight(&format!("LH400-{}", day), &date, "LH", "landed", 0),
                    flight(&format!("AF22-{}", day), &date, "AF", "cancelled", 0),
                ]
            })
            .collect()
    }

    /// A flight with no airline code
    pub fn flight_without_airline(id: &str, date: &str) -> Row {
        let mut row = flight(id, date, "XX", "landed", 5);
        row.insert("airline_iata_code".to_string(), Value::Null);
        row
    }

    /// Weather observations for each of the given days
    pub fn weather_for_days(days: &[u32]) -> Vec<Row> {
        days.iter()
            .map(|day| {
                object(json!({
                    "airport_iata_code": "LHR",
                    "observed_at": format!("{}T12:00:00Z", dates::key(*day)),
                    "wind_speed_kt": 14,
                }))
            })
            .collect()
    }

    /// Airport reference rows
    pub fn airports() -> Vec<Row> {
        vec![
            object(json!({"airport_iata_code": "LHR", "name": "London Heathrow"})),
            object(json!({"airport_iata_code": "FRA", "name": "Frankfurt am Main"})),
        ]
    }
}
