//! Asset definitions
//!
//! An asset is a named unit of derived data. Each asset declares how it is
//! partitioned, when it should be recomputed, which quality checks guard its
//! output and which shared resources its compute consumes. Assets are built
//! once during configuration load and are immutable for the rest of a run.

use crate::partition::{KeyRange, PartitionKey};
use crate::quality::CheckId;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// Partition dimension of an asset
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionDimension {
    /// A single implicit partition
    #[default]
    None,

    /// One partition per calendar day, from `start_date` up to the current day
    Daily {
        /// First day with data
        start_date: NaiveDate,
    },

    /// An explicit, fixed list of keys
    Custom {
        /// Declared partition keys
        keys: Vec<String>,
    },
}

impl PartitionDimension {
    pub fn is_partitioned(&self) -> bool {
        !matches!(self, PartitionDimension::None)
    }

    /// Short name used in errors and listings
    pub fn kind_name(&self) -> &'static str {
        match self {
            PartitionDimension::None => "unpartitioned",
            PartitionDimension::Daily { .. } => "daily",
            PartitionDimension::Custom { .. } => "custom",
        }
    }

    /// All keys in the dimension as of `today`, ascending
    pub fn keys_until(&self, today: NaiveDate) -> Vec<PartitionKey> {
        match self {
            PartitionDimension::None => vec![PartitionKey::unpartitioned()],
            PartitionDimension::Daily { start_date } => {
                let mut keys = Vec::new();
                let mut current = *start_date;
                while current <= today {
                    keys.push(PartitionKey::from_date(current));
                    current += Duration::days(1);
                }
                keys
            }
            PartitionDimension::Custom { keys } => {
                let mut keys: Vec<PartitionKey> =
                    keys.iter().map(|k| PartitionKey::new(k.as_str())).collect();
                keys.sort();
                keys.dedup();
                keys
            }
        }
    }

    /// Keys as of `today` that fall inside `range`
    pub fn keys_in_range(&self, range: &KeyRange, today: NaiveDate) -> Vec<PartitionKey> {
        match self {
            // Avoid walking years of days when the range is bounded
            PartitionDimension::Daily { start_date } => {
                let lower = range
                    .start
                    .as_ref()
                    .and_then(PartitionKey::as_date)
                    .map_or(*start_date, |d| d.max(*start_date));
                let upper = range
                    .end
                    .as_ref()
                    .and_then(PartitionKey::as_date)
                    .map_or(today, |d| d.min(today));
                let mut keys = Vec::new();
                let mut current = lower;
                while current <= upper {
                    let key = PartitionKey::from_date(current);
                    if range.contains(&key) {
                        keys.push(key);
                    }
                    current += Duration::days(1);
                }
                keys
            }
            _ => self
                .keys_until(today)
                .into_iter()
                .filter(|k| range.contains(k))
                .collect(),
        }
    }

    /// Whether `key` belongs to this dimension as of `today`
    pub fn contains_key(&self, key: &PartitionKey, today: NaiveDate) -> bool {
        match self {
            PartitionDimension::None => key.is_unpartitioned(),
            PartitionDimension::Daily { start_date } => key
                .as_date()
                .map(|d| d >= *start_date && d <= today)
                .unwrap_or(false),
            PartitionDimension::Custom { keys } => keys.iter().any(|k| k == key.as_str()),
        }
    }
}

/// When the staleness resolver considers an asset for recomputation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessPolicy {
    /// Recompute whenever inputs change, including upstream work planned in the same run
    #[default]
    Eager,

    /// Recompute once an upstream change has been committed
    OnUpstreamChange,

    /// Only recomputed by an explicit backfill
    Manual,
}

impl StalenessPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            StalenessPolicy::Eager => "eager",
            StalenessPolicy::OnUpstreamChange => "on_upstream_change",
            StalenessPolicy::Manual => "manual",
        }
    }
}

/// A node in the asset graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetNode {
    /// Unique name
    pub name: String,

    pub description: Option<String>,

    /// Logical layer such as `raw` or `cleaned`
    pub group: Option<String>,

    pub tags: Vec<String>,

    pub partitions: PartitionDimension,

    pub policy: StalenessPolicy,

    /// Quality checks evaluated after each materialization
    pub checks: Vec<CheckId>,

    /// Named resources whose sub-limits apply to this asset's units
    pub resources: Vec<String>,
}

impl AssetNode {
    /// Create an unpartitioned, eager asset
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            group: None,
            tags: Vec::new(),
            partitions: PartitionDimension::None,
            policy: StalenessPolicy::Eager,
            checks: Vec::new(),
            resources: Vec::new(),
        }
    }

    /// Create a builder for constructing an asset with fluent API
    pub fn builder(name: impl Into<String>) -> AssetNodeBuilder {
        AssetNodeBuilder::new(name)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.group.as_deref() == Some(group)
    }
}

/// Builder for constructing assets with a fluent API
pub struct AssetNodeBuilder {
    node: AssetNode,
}

impl AssetNodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            node: AssetNode::new(name),
        }
    }

    /// Set the asset description
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.node.description = Some(desc.into());
        self
    }

    /// Set the asset group
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.node.group = Some(group.into());
        self
    }

    /// Add a tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.node.tags.push(tag.into());
        self
    }

    /// Add multiple tags
    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.node.tags.extend(tags);
        self
    }

    /// Partition by day starting at `start_date`
    pub fn partitioned_daily(mut self, start_date: NaiveDate) -> Self {
        self.node.partitions = PartitionDimension::Daily { start_date };
        self
    }

    /// Partition by an explicit key list
    pub fn partitioned_custom<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node.partitions = PartitionDimension::Custom {
            keys: keys.into_iter().map(Into::into).collect(),
        };
        self
    }

    pub fn partitions(mut self, partitions: PartitionDimension) -> Self {
        self.node.partitions = partitions;
        self
    }

    pub fn policy(mut self, policy: StalenessPolicy) -> Self {
        self.node.policy = policy;
        self
    }

    /// Attach a quality check
    pub fn check(mut self, check: impl Into<CheckId>) -> Self {
        self.node.checks.push(check.into());
        self
    }

    /// Declare a resource the compute consumes
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.node.resources.push(resource.into());
        self
    }

    pub fn build(self) -> AssetNode {
        self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_builder() {
        let asset = AssetNode::builder("cleaned_flights")
            .description("Flights with cancelled rows removed")
            .group("cleaned")
            .tag("flights")
            .partitioned_daily(date(2024, 3, 1))
            .policy(StalenessPolicy::OnUpstreamChange)
            .check("no_null_airline_code")
            .resource("postgres")
            .build();

        assert_eq!(asset.name, "cleaned_flights");
        assert!(asset.in_group("cleaned"));
        assert!(asset.has_tag("flights"));
        assert!(asset.partitions.is_partitioned());
        assert_eq!(asset.policy, StalenessPolicy::OnUpstreamChange);
        assert_eq!(asset.checks, vec![CheckId::from("no_null_airline_code")]);
        assert_eq!(asset.resources, vec!["postgres".to_string()]);
    }

    #[test]
    fn test_default_asset_is_unpartitioned_and_eager() {
        let asset = AssetNode::new("airports");
        assert_eq!(asset.partitions, PartitionDimension::None);
        assert_eq!(asset.policy, StalenessPolicy::Eager);
        assert_eq!(
            asset.partitions.keys_until(date(2024, 3, 1)),
            vec![PartitionKey::unpartitioned()]
        );
    }

    #[test]
    fn test_daily_keys_until_today() {
        let dim = PartitionDimension::Daily {
            start_date: date(2024, 2, 28),
        };
        let keys = dim.keys_until(date(2024, 3, 1));
        let keys: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["2024-02-28", "2024-02-29", "2024-03-01"]);

        assert!(dim.keys_until(date(2024, 2, 27)).is_empty());
    }

    #[test]
    fn test_daily_keys_in_range_are_clipped() {
        let dim = PartitionDimension::Daily {
            start_date: date(2024, 1, 2),
        };
        let range = KeyRange::between("2024-01-01", "2024-01-10");
        let keys = dim.keys_in_range(&range, date(2024, 1, 4));
        let keys: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["2024-01-02", "2024-01-03", "2024-01-04"]);
    }

    #[test]
    fn test_custom_keys_sorted_and_deduplicated() {
        let dim = PartitionDimension::Custom {
            keys: vec!["LAX".into(), "JFK".into(), "LAX".into()],
        };
        let keys = dim.keys_until(date(2024, 1, 1));
        assert_eq!(keys, vec![PartitionKey::new("JFK"), PartitionKey::new("LAX")]);
        assert!(dim.contains_key(&"JFK".into(), date(2024, 1, 1)));
        assert!(!dim.contains_key(&"SFO".into(), date(2024, 1, 1)));
    }

    #[test]
    fn test_daily_contains_key() {
        let dim = PartitionDimension::Daily {
            start_date: date(2024, 3, 1),
        };
        let today = date(2024, 3, 3);
        assert!(dim.contains_key(&"2024-03-02".into(), today));
        assert!(!dim.contains_key(&"2024-02-29".into(), today));
        assert!(!dim.contains_key(&"2024-03-04".into(), today));
        assert!(!dim.contains_key(&"not-a-date".into(), today));
    }

    #[test]
    fn test_dimension_deserializes_from_yaml_shape() {
        let dim: PartitionDimension =
            serde_json::from_value(serde_json::json!({"type": "daily", "start_date": "2024-03-01"}))
                .unwrap();
        assert_eq!(
            dim,
            PartitionDimension::Daily {
                start_date: date(2024, 3, 1)
            }
        );
    }
}
