//! Declarative pipeline configuration
//!
//! A pipeline is described in YAML: engine settings plus a list of assets with
//! their partitions, staleness policy, compute kind, quality checks and
//! dependencies. [`PipelineConfig::build`] turns the document into a validated
//! [`PipelineDefinition`]; every unresolved reference, duplicate or cycle is
//! reported here, before anything executes.

use crate::asset::{AssetNode, PartitionDimension, StalenessPolicy};
use crate::graph::{AssetGraph, GraphError};
use crate::partition_mapping::PartitionMapping;
use crate::quality::{CheckId, CheckSeverity, CheckType, QualityCheck};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid pipeline YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Quality check declared more than once: {0}")]
    DuplicateCheck(String),

    #[error("Asset {asset} references unknown asset {reference}")]
    UnknownReference { asset: String, reference: String },

    #[error("Invalid compute for asset {asset}: {reason}")]
    InvalidCompute { asset: String, reason: String },

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),
}

/// Retry settings for transient unit failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Where the partition catalog is persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CatalogSettings {
    /// Process-local, lost on exit
    Memory,

    /// JSON snapshot on local disk
    File { path: PathBuf },

    /// PostgreSQL; `url` falls back to `DATABASE_URL`
    Postgres {
        #[serde(default)]
        url: Option<String>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    5
}

impl Default for CatalogSettings {
    fn default() -> Self {
        CatalogSettings::File {
            path: PathBuf::from(".runway/catalog.json"),
        }
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Maximum units in flight
    pub concurrency: usize,

    /// Per-resource sub-limits, e.g. `postgres: 2`
    pub resource_limits: BTreeMap<String, usize>,

    pub retry: RetrySettings,

    /// Maximum partitions per asset in one backfill
    pub backfill_limit: usize,

    pub catalog: CatalogSettings,

    /// Directory for the file-backed output store
    pub data_dir: PathBuf,

    /// Directory read by the file source fetcher
    pub source_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            resource_limits: BTreeMap::new(),
            retry: RetrySettings::default(),
            backfill_limit: 366,
            catalog: CatalogSettings::default(),
            data_dir: PathBuf::from(".runway/data"),
            source_dir: PathBuf::from("data/sources"),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidSetting(
                "concurrency must be > 0".to_string(),
            ));
        }
        if let Some((name, _)) = self.resource_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(ConfigError::InvalidSetting(format!(
                "resource limit for '{}' must be > 0",
                name
            )));
        }
        if self.backfill_limit == 0 {
            return Err(ConfigError::InvalidSetting(
                "backfill_limit must be > 0".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidSetting(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Aggregate function used by rollups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// One output column of a rollup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Input column; `count` without one counts rows
    #[serde(default)]
    pub column: Option<String>,
    pub function: AggregateFunction,
    /// Output column name
    #[serde(rename = "as")]
    pub alias: String,
}

/// How an asset's rows are produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComputeSpec {
    /// Ingest rows from an external source
    Source {
        source_id: String,
        /// Column holding the record date; daily partitions keep matching rows only
        #[serde(default)]
        timestamp_field: Option<String>,
    },

    /// Concatenate the rows of every upstream partition
    Union,

    /// Drop rows whose column holds one of the excluded values
    Filter {
        column: String,
        exclude_values: Vec<serde_json::Value>,
        /// Columns that must be present and non-null
        #[serde(default)]
        require_columns: Vec<String>,
    },

    /// Left-join the other upstreams with `right` on the given columns
    Join { right: String, on: Vec<String> },

    /// Group upstream rows and compute aggregates
    Rollup {
        group_by: Vec<String>,
        aggregates: Vec<Aggregate>,
    },
}

impl ComputeSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            ComputeSpec::Source { .. } => "source",
            ComputeSpec::Union => "union",
            ComputeSpec::Filter { .. } => "filter",
            ComputeSpec::Join { .. } => "join",
            ComputeSpec::Rollup { .. } => "rollup",
        }
    }
}

/// A quality check declared on an asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckConfig {
    pub id: String,
    #[serde(default)]
    pub severity: CheckSeverity,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub check_type: CheckType,
}

fn default_enabled() -> bool {
    true
}

/// A dependency declared on an asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub asset: String,
    /// Inferred from both partition dimensions when omitted
    #[serde(default)]
    pub mapping: Option<PartitionMapping>,
}

/// One asset in the pipeline document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub partitions: PartitionDimension,
    #[serde(default)]
    pub policy: StalenessPolicy,
    #[serde(default)]
    pub resources: Vec<String>,
    /// Defaults to a source named after the asset when there are no deps, a union otherwise
    #[serde(default)]
    pub compute: Option<ComputeSpec>,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
    #[serde(default)]
    pub deps: Vec<DependencyConfig>,
}

/// Top-level pipeline document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub settings: Settings,
    pub assets: Vec<AssetConfig>,
}

/// Validated pipeline ready for execution
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub graph: AssetGraph,
    pub computes: BTreeMap<String, ComputeSpec>,
    pub checks: BTreeMap<CheckId, QualityCheck>,
    pub settings: Settings,
}

impl PipelineDefinition {
    /// Enabled checks attached to `asset`, in declaration order
    pub fn checks_for(&self, asset: &str) -> Vec<QualityCheck> {
        self.graph
            .get(asset)
            .map(|node| {
                node.checks
                    .iter()
                    .filter_map(|id| self.checks.get(id))
                    .filter(|check| check.enabled)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Validate the document and build the asset graph
    pub fn build(self) -> Result<PipelineDefinition, ConfigError> {
        self.settings.validate()?;

        let mut graph = AssetGraph::new();
        let mut checks: BTreeMap<CheckId, QualityCheck> = BTreeMap::new();
        let mut computes = BTreeMap::new();

        for asset in &self.assets {
            let mut builder = AssetNode::builder(asset.name.as_str())
                .partitions(asset.partitions.clone())
                .policy(asset.policy)
                .tags(asset.tags.clone());
            if let Some(desc) = &asset.description {
                builder = builder.description(desc.as_str());
            }
            if let Some(group) = &asset.group {
                builder = builder.group(group.as_str());
            }
            for resource in &asset.resources {
                builder = builder.resource(resource.as_str());
            }

            for check in &asset.checks {
                let id = CheckId::new(check.id.as_str());
                if checks.contains_key(&id) {
                    return Err(ConfigError::DuplicateCheck(check.id.clone()));
                }
                let mut definition =
                    QualityCheck::new(id.clone(), asset.name.as_str(), check.check_type.clone())
                        .severity(check.severity)
                        .enabled(check.enabled);
                if let Some(desc) = &check.description {
                    definition = definition.description(desc.as_str());
                }
                checks.insert(id.clone(), definition);
                builder = builder.check(id);
            }

            graph.register(builder.build())?;
        }

        for asset in &self.assets {
            for dep in &asset.deps {
                if !graph.contains(&dep.asset) {
                    return Err(ConfigError::UnknownReference {
                        asset: asset.name.clone(),
                        reference: dep.asset.clone(),
                    });
                }
                match &dep.mapping {
                    Some(mapping) => graph.add_edge(&dep.asset, &asset.name, mapping.clone())?,
                    None => graph.add_inferred_edge(&dep.asset, &asset.name)?,
                }
            }

            let compute = resolve_compute(asset)?;
            computes.insert(asset.name.clone(), compute);
        }

        for check in checks.values() {
            if let Some(reference) = check.check_type.referenced_asset() {
                if !graph.contains(reference) {
                    return Err(ConfigError::UnknownReference {
                        asset: check.asset.clone(),
                        reference: reference.to_string(),
                    });
                }
            }
        }

        debug!(
            assets = graph.len(),
            edges = graph.edge_count(),
            checks = checks.len(),
            "Pipeline definition built"
        );

        Ok(PipelineDefinition {
            graph,
            computes,
            checks,
            settings: self.settings,
        })
    }
}

fn resolve_compute(asset: &AssetConfig) -> Result<ComputeSpec, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidCompute {
        asset: asset.name.clone(),
        reason: reason.to_string(),
    };

    let compute = match &asset.compute {
        Some(compute) => compute.clone(),
        None if asset.deps.is_empty() => ComputeSpec::Source {
            source_id: asset.name.clone(),
            timestamp_field: None,
        },
        None => ComputeSpec::Union,
    };

    match &compute {
        ComputeSpec::Source { .. } => {
            if !asset.deps.is_empty() {
                return Err(invalid("source assets cannot declare dependencies"));
            }
        }
        ComputeSpec::Union | ComputeSpec::Rollup { .. } => {
            if asset.deps.is_empty() {
                return Err(invalid("requires at least one dependency"));
            }
        }
        ComputeSpec::Filter { .. } => {
            if asset.deps.len() != 1 {
                return Err(invalid("filter requires exactly one dependency"));
            }
        }
        ComputeSpec::Join { right, on } => {
            if on.is_empty() {
                return Err(invalid("join requires at least one key column"));
            }
            if !asset.deps.iter().any(|d| &d.asset == right) {
                return Err(invalid("join right side must be a declared dependency"));
            }
            if asset.deps.len() < 2 {
                return Err(invalid("join requires a left and a right dependency"));
            }
        }
    }

    if let ComputeSpec::Rollup { aggregates, .. } = &compute {
        for aggregate in aggregates {
            if aggregate.function != AggregateFunction::Count && aggregate.column.is_none() {
                return Err(invalid("non-count aggregates require a column"));
            }
        }
    }

    Ok(compute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition_mapping::PartitionMappingError;

    const PIPELINE: &str = r#"
settings:
  concurrency: 2
  resource_limits:
    postgres: 1
assets:
  - name: raw_flights
    group: raw
    partitions: { type: daily, start_date: 2024-03-01 }
    compute: { type: source, source_id: flights, timestamp_field: flight_date }
  - name: airports
    group: raw
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
      - id: known_airports
        severity: advisory
        type: referential_integrity
        column: dep_iata
        reference_asset: airports
        reference_column: iata_code
    deps:
      - asset: raw_flights
  - name: flight_summary
    group: metrics
    policy: manual
    compute:
      type: rollup
      group_by: [airline_iata_code]
      aggregates:
        - { function: count, as: flights }
    deps:
      - asset: cleaned_flights
"#;

    #[test]
    fn test_build_pipeline() {
        let definition = PipelineConfig::from_yaml_str(PIPELINE)
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(definition.graph.len(), 4);
        assert_eq!(definition.settings.concurrency, 2);
        assert_eq!(definition.settings.resource_limits.get("postgres"), Some(&1));
        assert_eq!(
            definition.graph.topological_order(),
            vec!["airports", "raw_flights", "cleaned_flights", "flight_summary"]
        );

        // daily -> unpartitioned is inferred as a rollup
        let upstream = definition.graph.upstream("flight_summary").unwrap();
        assert_eq!(upstream[0].mapping, &PartitionMapping::AllPartitions);

        // Assets without deps or compute default to a source named after the asset
        assert_eq!(
            definition.computes.get("airports"),
            Some(&ComputeSpec::Source {
                source_id: "airports".to_string(),
                timestamp_field: None
            })
        );

        let checks = definition.checks_for("cleaned_flights");
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[1].severity, CheckSeverity::Advisory);
        assert_eq!(
            definition.graph.get("flight_summary").unwrap().policy,
            StalenessPolicy::Manual
        );
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let yaml = r#"
assets:
  - name: cleaned
    deps:
      - asset: raw
"#;
        let err = PipelineConfig::from_yaml_str(yaml).unwrap().build().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownReference { .. }));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let yaml = r#"
assets:
  - name: a
    deps: [{ asset: b }]
  - name: b
    deps: [{ asset: a }]
"#;
        let err = PipelineConfig::from_yaml_str(yaml).unwrap().build().unwrap_err();
        assert!(matches!(err, ConfigError::Graph(GraphError::Cycle { .. })));
    }

    #[test]
    fn test_oversized_time_offset_is_rejected() {
        let yaml = r#"
assets:
  - name: a
    partitions: { type: daily, start_date: 2024-03-01 }
  - name: b
    partitions: { type: daily, start_date: 2024-03-01 }
    deps:
      - asset: a
        mapping: { type: time_offset, offset: 2147483647 }
"#;
        let err = PipelineConfig::from_yaml_str(yaml).unwrap().build().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Graph(GraphError::IncompatibleMapping {
                source: PartitionMappingError::SpanTooLarge { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_duplicate_asset_and_check_rejected() {
        let yaml = r#"
assets:
  - name: a
  - name: a
"#;
        let err = PipelineConfig::from_yaml_str(yaml).unwrap().build().unwrap_err();
        assert!(matches!(err, ConfigError::Graph(GraphError::DuplicateAsset(_))));

        let yaml = r#"
assets:
  - name: a
    checks:
      - { id: not_empty, type: row_count, min: 1 }
  - name: b
    checks:
      - { id: not_empty, type: row_count, min: 1 }
"#;
        let err = PipelineConfig::from_yaml_str(yaml).unwrap().build().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateCheck(id) if id == "not_empty"));
    }

    #[test]
    fn test_unknown_check_reference_rejected() {
        let yaml = r#"
assets:
  - name: a
    checks:
      - id: fk
        type: referential_integrity
        column: x
        reference_asset: dims
        reference_column: id
"#;
        let err = PipelineConfig::from_yaml_str(yaml).unwrap().build().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownReference { reference, .. } if reference == "dims"));
    }

    #[test]
    fn test_invalid_compute_rejected() {
        let yaml = r#"
assets:
  - name: a
  - name: b
    compute: { type: filter, column: x, exclude_values: [] }
    deps: []
"#;
        let err = PipelineConfig::from_yaml_str(yaml).unwrap().build().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCompute { .. }));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let yaml = r#"
settings:
  concurrency: 0
assets: []
"#;
        let err = PipelineConfig::from_yaml_str(yaml).unwrap().build().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting(_)));
    }
}
