//! Built-in compute kinds
//!
//! Each asset's `compute` block selects one of these. Custom computes can be
//! registered per asset through [`ComputeRegistry::insert`].

use async_trait::async_trait;
use runway_core::{
    Aggregate, AggregateFunction, ComputeSpec, PipelineDefinition, Row, SourceFetcher, Watermark,
};
use serde_json::{Number, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::checks::parse_timestamp;
use crate::unit::{AssetCompute, ComputeContext, UnitError};

/// Ingests rows from an external source
pub struct SourceCompute {
    fetcher: Arc<dyn SourceFetcher>,
    source_id: String,
    timestamp_field: Option<String>,
}

impl SourceCompute {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        source_id: impl Into<String>,
        timestamp_field: Option<String>,
    ) -> Self {
        Self {
            fetcher,
            source_id: source_id.into(),
            timestamp_field,
        }
    }
}

#[async_trait]
impl AssetCompute for SourceCompute {
    fn kind(&self) -> &'static str {
        "source"
    }

    fn reads_upstreams(&self) -> bool {
        false
    }

    async fn compute(&self, ctx: &ComputeContext) -> Result<Vec<Row>, UnitError> {
        let partition_date = ctx.partition.key.as_date();
        let watermark = Watermark {
            partition_date,
            since: ctx.last_success_at,
        };

        let rows = self.fetcher.fetch(&self.source_id, &watermark).await?;
        let fetched = rows.len();

        let rows = match (&self.timestamp_field, partition_date) {
            (Some(field), Some(date)) => rows
                .into_iter()
                .filter(|row| {
                    row.get(field)
                        .and_then(parse_timestamp)
                        .map_or(false, |ts| ts.date_naive() == date)
                })
                .collect(),
            _ => rows,
        };

        debug!(
            source_id = %self.source_id,
            fetched,
            kept = rows.len(),
            "Fetched source rows"
        );
        Ok(rows)
    }
}

/// Concatenates every upstream partition
pub struct UnionCompute;

#[async_trait]
impl AssetCompute for UnionCompute {
    fn kind(&self) -> &'static str {
        "union"
    }

    async fn compute(&self, ctx: &ComputeContext) -> Result<Vec<Row>, UnitError> {
        Ok(ctx.all_rows().cloned().collect())
    }
}

/// Drops excluded values and rows missing required columns
pub struct FilterCompute {
    column: String,
    exclude: HashSet<String>,
    require_columns: Vec<String>,
}

impl FilterCompute {
    pub fn new(
        column: impl Into<String>,
        exclude_values: &[Value],
        require_columns: Vec<String>,
    ) -> Self {
        Self {
            column: column.into(),
            exclude: exclude_values.iter().map(Value::to_string).collect(),
            require_columns,
        }
    }

    fn keep(&self, row: &Row) -> bool {
        let excluded = row
            .get(&self.column)
            .map_or(false, |v| self.exclude.contains(&v.to_string()));
        let complete = self
            .require_columns
            .iter()
            .all(|c| row.get(c).map_or(false, |v| !v.is_null()));
        !excluded && complete
    }
}

#[async_trait]
impl AssetCompute for FilterCompute {
    fn kind(&self) -> &'static str {
        "filter"
    }

    async fn compute(&self, ctx: &ComputeContext) -> Result<Vec<Row>, UnitError> {
        Ok(ctx.all_rows().filter(|row| self.keep(row)).cloned().collect())
    }
}

/// Left-joins the other upstreams with `right`
pub struct JoinCompute {
    right: String,
    on: Vec<String>,
}

impl JoinCompute {
    pub fn new(right: impl Into<String>, on: Vec<String>) -> Self {
        Self {
            right: right.into(),
            on,
        }
    }

    fn join_key(&self, row: &Row) -> Option<String> {
        let mut parts = Vec::with_capacity(self.on.len());
        for column in &self.on {
            match row.get(column) {
                Some(v) if !v.is_null() => parts.push(v.to_string()),
                _ => return None,
            }
        }
        Some(parts.join("|"))
    }
}

#[async_trait]
impl AssetCompute for JoinCompute {
    fn kind(&self) -> &'static str {
        "join"
    }

    async fn compute(&self, ctx: &ComputeContext) -> Result<Vec<Row>, UnitError> {
        let mut index: HashMap<String, Vec<&Row>> = HashMap::new();
        for row in ctx.rows_of(&self.right) {
            if let Some(key) = self.join_key(row) {
                index.entry(key).or_default().push(row);
            }
        }

        let left_rows = ctx
            .inputs
            .iter()
            .filter(|input| input.partition.asset != self.right)
            .flat_map(|input| input.rows.iter());

        let mut joined = Vec::new();
        for left in left_rows {
            let matches = self.join_key(left).and_then(|key| index.get(&key));
            match matches {
                Some(rights) => {
                    for right in rights {
                        let mut row = left.clone();
                        for (column, value) in right.iter() {
                            row.entry(column.clone()).or_insert_with(|| value.clone());
                        }
                        joined.push(row);
                    }
                }
                None => joined.push(left.clone()),
            }
        }
        Ok(joined)
    }
}

/// Groups rows and computes aggregates
pub struct RollupCompute {
    group_by: Vec<String>,
    aggregates: Vec<Aggregate>,
}

impl RollupCompute {
    pub fn new(group_by: Vec<String>, aggregates: Vec<Aggregate>) -> Self {
        Self {
            group_by,
            aggregates,
        }
    }
}

#[async_trait]
impl AssetCompute for RollupCompute {
    fn kind(&self) -> &'static str {
        "rollup"
    }

    async fn compute(&self, ctx: &ComputeContext) -> Result<Vec<Row>, UnitError> {
        // Keyed by the serialized group values so output order is deterministic
        let mut groups: BTreeMap<String, (Vec<Value>, Vec<&Row>)> = BTreeMap::new();
        for row in ctx.all_rows() {
            let values: Vec<Value> = self
                .group_by
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            let key = Value::Array(values.clone()).to_string();
            groups.entry(key).or_insert_with(|| (values, Vec::new())).1.push(row);
        }

        let mut output = Vec::with_capacity(groups.len());
        for (values, rows) in groups.into_values() {
            let mut out = Row::new();
            for (column, value) in self.group_by.iter().zip(values) {
                out.insert(column.clone(), value);
            }
            for aggregate in &self.aggregates {
                out.insert(
                    aggregate.alias.clone(),
                    aggregate_value(aggregate.function, aggregate.column.as_deref(), &rows),
                );
            }
            output.push(out);
        }
        Ok(output)
    }
}

fn aggregate_value(function: AggregateFunction, column: Option<&str>, rows: &[&Row]) -> Value {
    let values = || {
        rows.iter()
            .filter_map(move |row| column.and_then(|c| row.get(c)))
            .filter(|v| !v.is_null())
    };

    match function {
        AggregateFunction::Count => {
            let count = match column {
                Some(_) => values().count(),
                None => rows.len(),
            };
            Value::from(count as u64)
        }
        AggregateFunction::Sum | AggregateFunction::Min | AggregateFunction::Max => {
            let numbers: Vec<&Number> = values()
                .filter_map(|v| match v {
                    Value::Number(n) => Some(n),
                    _ => None,
                })
                .collect();
            let integers: Option<Vec<i64>> = numbers.iter().map(|n| n.as_i64()).collect();
            match integers {
                Some(ints) => match function {
                    AggregateFunction::Sum => Value::from(ints.iter().sum::<i64>()),
                    AggregateFunction::Min => ints.iter().min().map_or(Value::Null, |v| (*v).into()),
                    _ => ints.iter().max().map_or(Value::Null, |v| (*v).into()),
                },
                None => {
                    let floats = numbers.iter().filter_map(|n| n.as_f64());
                    let folded = match function {
                        AggregateFunction::Sum => Some(floats.sum::<f64>()),
                        AggregateFunction::Min => floats.reduce(f64::min),
                        _ => floats.reduce(f64::max),
                    };
                    folded.map_or(Value::Null, float_value)
                }
            }
        }
        AggregateFunction::Avg => {
            let floats: Vec<f64> = values().filter_map(Value::as_f64).collect();
            if floats.is_empty() {
                Value::Null
            } else {
                float_value(floats.iter().sum::<f64>() / floats.len() as f64)
            }
        }
    }
}

fn float_value(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

/// Compute implementation per asset
#[derive(Clone, Default)]
pub struct ComputeRegistry {
    computes: HashMap<String, Arc<dyn AssetCompute>>,
}

impl ComputeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the declared compute of every asset in the pipeline
    pub fn from_definition(
        definition: &PipelineDefinition,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        let mut registry = Self::new();
        for (asset, spec) in &definition.computes {
            let compute: Arc<dyn AssetCompute> = match spec {
                ComputeSpec::Source {
                    source_id,
                    timestamp_field,
                } => Arc::new(SourceCompute::new(
                    fetcher.clone(),
                    source_id.clone(),
                    timestamp_field.clone(),
                )),
                ComputeSpec::Union => Arc::new(UnionCompute),
                ComputeSpec::Filter {
                    column,
                    exclude_values,
                    require_columns,
                } => Arc::new(FilterCompute::new(
                    column.clone(),
                    exclude_values,
                    require_columns.clone(),
                )),
                ComputeSpec::Join { right, on } => {
                    Arc::new(JoinCompute::new(right.clone(), on.clone()))
                }
                ComputeSpec::Rollup {
                    group_by,
                    aggregates,
                } => Arc::new(RollupCompute::new(group_by.clone(), aggregates.clone())),
            };
            registry.insert(asset.clone(), compute);
        }
        registry
    }

    /// Register or replace the compute for `asset`
    pub fn insert(&mut self, asset: impl Into<String>, compute: Arc<dyn AssetCompute>) {
        self.computes.insert(asset.into(), compute);
    }

    pub fn get(&self, asset: &str) -> Option<Arc<dyn AssetCompute>> {
        self.computes.get(asset).cloned()
    }

    pub fn contains(&self, asset: &str) -> bool {
        self.computes.contains_key(asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UpstreamInput;
    use runway_core::{FetchError, PartitionRef};
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn ctx(inputs: Vec<(&str, Vec<Row>)>) -> ComputeContext {
        ComputeContext {
            partition: PartitionRef::new("target", "2024-03-01"),
            inputs: inputs
                .into_iter()
                .map(|(asset, rows)| UpstreamInput {
                    partition: PartitionRef::new(asset, "2024-03-01"),
                    rows,
                })
                .collect(),
            last_success_at: None,
            attempt: 1,
        }
    }

    struct FixedFetcher(Vec<Row>);

    #[async_trait]
    impl SourceFetcher for FixedFetcher {
        async fn fetch(&self, _source_id: &str, _watermark: &Watermark) -> Result<Vec<Row>, FetchError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_source_keeps_partition_day() {
        let fetcher = Arc::new(FixedFetcher(vec![
            row(json!({"id": 1, "scheduled": "2024-03-01T08:00:00Z"})),
            row(json!({"id": 2, "scheduled": "2024-03-02T08:00:00Z"})),
            row(json!({"id": 3})),
        ]));
        let compute = SourceCompute::new(fetcher, "flights", Some("scheduled".to_string()));
        let rows = compute.compute(&ctx(vec![])).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
    }

    #[tokio::test]
    async fn test_filter_drops_cancelled_and_incomplete() {
        let compute = FilterCompute::new(
            "status",
            &[json!("cancelled")],
            vec!["airline_iata_code".to_string()],
        );
        let rows = compute
            .compute(&ctx(vec![(
                "raw_flights",
                vec![
                    row(json!({"status": "scheduled", "airline_iata_code": "AA"})),
                    row(json!({"status": "cancelled", "airline_iata_code": "UA"})),
                    row(json!({"status": "landed", "airline_iata_code": null})),
                ],
            )]))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_join_enriches_left_rows() {
        let compute = JoinCompute::new("weather", vec!["airport".to_string()]);
        let rows = compute
            .compute(&ctx(vec![
                (
                    "flights",
                    vec![
                        row(json!({"id": 1, "airport": "JFK"})),
                        row(json!({"id": 2, "airport": "SFO"})),
                    ],
                ),
                ("weather", vec![row(json!({"airport": "JFK", "temp_c": 4}))]),
            ]))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["temp_c"], json!(4));
        assert!(rows[1].get("temp_c").is_none());
    }

    #[tokio::test]
    async fn test_rollup_groups_and_aggregates() {
        let compute = RollupCompute::new(
            vec!["airline".to_string()],
            vec![
                Aggregate {
                    column: None,
                    function: AggregateFunction::Count,
                    alias: "flights".to_string(),
                },
                Aggregate {
                    column: Some("delay".to_string()),
                    function: AggregateFunction::Avg,
                    alias: "avg_delay".to_string(),
                },
                Aggregate {
                    column: Some("delay".to_string()),
                    function: AggregateFunction::Max,
                    alias: "max_delay".to_string(),
                },
            ],
        );
        let rows = compute
            .compute(&ctx(vec![(
                "cleaned",
                vec![
                    row(json!({"airline": "UA", "delay": 10})),
                    row(json!({"airline": "AA", "delay": 4})),
                    row(json!({"airline": "UA", "delay": 20})),
                ],
            )]))
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["airline"], json!("AA"));
        assert_eq!(rows[1]["flights"], json!(2));
        assert_eq!(rows[1]["avg_delay"], json!(15.0));
        assert_eq!(rows[1]["max_delay"], json!(20));
    }

    #[test]
    fn test_sum_of_mixed_numbers_is_float() {
        let a = row(json!({"v": 1}));
        let b = row(json!({"v": 2.5}));
        assert_eq!(
            aggregate_value(AggregateFunction::Sum, Some("v"), &[&a, &b]),
            json!(3.5)
        );
    }
}
