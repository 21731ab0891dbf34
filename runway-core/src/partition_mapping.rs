//! Partition mapping for asset dependencies
//!
//! A mapping on a dependency edge says which upstream partitions a downstream
//! partition reads. Supported mappings:
//!
//! - **Identity**: same key on both sides (daily -> daily with same date)
//! - **Time window**: a trailing window of upstream days (rolling 7-day metrics)
//! - **Time offset**: one upstream day shifted by N days (yesterday's data)
//! - **All partitions**: every upstream partition feeds the downstream one (rollups)
//!
//! Mapped keys are always clipped to the upstream dimension, so a downstream
//! partition never waits on an upstream partition that cannot exist. An
//! unpartitioned upstream always maps to its single implicit key.
//!
//! # Example
//!
//! ```rust
//! use chrono::NaiveDate;
//! use runway_core::partition_mapping::PartitionMapping;
//! use runway_core::{PartitionDimension, PartitionKey};
//!
//! let daily = PartitionDimension::Daily {
//!     start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
//! };
//! let today = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
//! let keys = PartitionMapping::Identity.upstream_partitions(
//!     &PartitionKey::new("2024-01-15"),
//!     &daily,
//!     today,
//! );
//! assert_eq!(keys, vec![PartitionKey::new("2024-01-15")]);
//! ```

use crate::asset::PartitionDimension;
use crate::partition::PartitionKey;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// Largest window or offset, in days, a time mapping may span
pub const MAX_MAPPING_SPAN_DAYS: u32 = 3660;

/// Error types for partition mapping operations
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PartitionMappingError {
    /// The mapping cannot connect the two partition dimensions
    #[error("Incompatible partition dimensions: {downstream} cannot depend on {upstream} via {mapping}")]
    IncompatibleTypes {
        upstream: String,
        downstream: String,
        mapping: String,
    },

    /// Time windows must cover at least one partition
    #[error("Invalid time window size: {0} (must be >= 1)")]
    InvalidWindow(u32),

    /// Windows and offsets are bounded so every mapped key is a valid date
    #[error("{mapping} spans {days} days (max {max})", max = MAX_MAPPING_SPAN_DAYS)]
    SpanTooLarge { mapping: String, days: i64 },
}

/// Partition mapping strategies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionMapping {
    /// Downstream key equals upstream key
    #[default]
    Identity,

    /// Downstream day D reads upstream days D-(window_size-1) ..= D
    TimeWindow {
        /// Number of upstream partitions to include
        window_size: u32,
    },

    /// Downstream day D reads upstream day D+offset
    TimeOffset {
        /// Days to shift (negative = past)
        offset: i32,
    },

    /// Downstream partition reads every upstream partition
    AllPartitions,
}

impl PartitionMapping {
    pub fn type_name(&self) -> &'static str {
        match self {
            PartitionMapping::Identity => "identity",
            PartitionMapping::TimeWindow { .. } => "time_window",
            PartitionMapping::TimeOffset { .. } => "time_offset",
            PartitionMapping::AllPartitions => "all_partitions",
        }
    }

    /// Upstream partition keys read by `downstream_key`, ascending and clipped
    /// to the upstream dimension as of `today`
    pub fn upstream_partitions(
        &self,
        downstream_key: &PartitionKey,
        upstream: &PartitionDimension,
        today: NaiveDate,
    ) -> Vec<PartitionKey> {
        if !upstream.is_partitioned() {
            return vec![PartitionKey::unpartitioned()];
        }

        let candidates = match self {
            PartitionMapping::AllPartitions => return upstream.keys_until(today),
            PartitionMapping::Identity => vec![downstream_key.clone()],
            PartitionMapping::TimeWindow { window_size } => match downstream_key.as_date() {
                Some(date) => (0..i64::from(*window_size))
                    .rev()
                    .filter_map(|i| shift(date, -i))
                    .collect(),
                None => Vec::new(),
            },
            PartitionMapping::TimeOffset { offset } => match downstream_key.as_date() {
                Some(date) => shift(date, i64::from(*offset)).into_iter().collect(),
                None => Vec::new(),
            },
        };

        candidates
            .into_iter()
            .filter(|k| upstream.contains_key(k, today))
            .collect()
    }

    /// Downstream partition keys that read `upstream_key`; the inverse of
    /// [`PartitionMapping::upstream_partitions`]
    pub fn downstream_partitions(
        &self,
        upstream_key: &PartitionKey,
        downstream: &PartitionDimension,
        today: NaiveDate,
    ) -> Vec<PartitionKey> {
        if !downstream.is_partitioned() {
            return vec![PartitionKey::unpartitioned()];
        }
        // An unpartitioned upstream feeds every downstream partition
        if upstream_key.is_unpartitioned() {
            return downstream.keys_until(today);
        }

        let candidates = match self {
            PartitionMapping::AllPartitions => return downstream.keys_until(today),
            PartitionMapping::Identity => vec![upstream_key.clone()],
            PartitionMapping::TimeWindow { window_size } => match upstream_key.as_date() {
                Some(date) => (0..i64::from(*window_size))
                    .filter_map(|i| shift(date, i))
                    .collect(),
                None => Vec::new(),
            },
            PartitionMapping::TimeOffset { offset } => match upstream_key.as_date() {
                Some(date) => shift(date, -i64::from(*offset)).into_iter().collect(),
                None => Vec::new(),
            },
        };

        candidates
            .into_iter()
            .filter(|k| downstream.contains_key(k, today))
            .collect()
    }

    /// Check if this mapping can connect the given partition dimensions
    pub fn validate_compatibility(
        &self,
        upstream: &PartitionDimension,
        downstream: &PartitionDimension,
    ) -> Result<(), PartitionMappingError> {
        let incompatible = || PartitionMappingError::IncompatibleTypes {
            upstream: upstream.kind_name().to_string(),
            downstream: downstream.kind_name().to_string(),
            mapping: self.type_name().to_string(),
        };

        match self {
            PartitionMapping::AllPartitions => Ok(()),

            PartitionMapping::Identity => match (upstream, downstream) {
                (PartitionDimension::None, _) => Ok(()),
                (PartitionDimension::Daily { .. }, PartitionDimension::Daily { .. })
                | (PartitionDimension::Custom { .. }, PartitionDimension::Custom { .. }) => Ok(()),
                _ => Err(incompatible()),
            },

            PartitionMapping::TimeWindow { window_size } => {
                if *window_size == 0 {
                    return Err(PartitionMappingError::InvalidWindow(*window_size));
                }
                self.check_span(i64::from(*window_size))?;
                match (upstream, downstream) {
                    (PartitionDimension::Daily { .. }, PartitionDimension::Daily { .. }) => Ok(()),
                    _ => Err(incompatible()),
                }
            }

            PartitionMapping::TimeOffset { offset } => {
                self.check_span(i64::from(*offset).abs())?;
                match (upstream, downstream) {
                    (PartitionDimension::Daily { .. }, PartitionDimension::Daily { .. }) => Ok(()),
                    _ => Err(incompatible()),
                }
            }
        }
    }

    fn check_span(&self, days: i64) -> Result<(), PartitionMappingError> {
        if days > i64::from(MAX_MAPPING_SPAN_DAYS) {
            return Err(PartitionMappingError::SpanTooLarge {
                mapping: self.type_name().to_string(),
                days,
            });
        }
        Ok(())
    }
}

/// `date` moved by `days`, or `None` past the calendar's range
fn shift(date: NaiveDate, days: i64) -> Option<PartitionKey> {
    date.checked_add_signed(Duration::days(days))
        .map(PartitionKey::from_date)
}

/// Infer the mapping used when an edge declares none
pub fn infer_mapping(
    upstream: &PartitionDimension,
    downstream: &PartitionDimension,
) -> Result<PartitionMapping, PartitionMappingError> {
    match (upstream, downstream) {
        // Unpartitioned upstreams feed every downstream key
        (PartitionDimension::None, _) => Ok(PartitionMapping::Identity),

        (PartitionDimension::Daily { .. }, PartitionDimension::Daily { .. })
        | (PartitionDimension::Custom { .. }, PartitionDimension::Custom { .. }) => {
            Ok(PartitionMapping::Identity)
        }

        // Partitioned -> unpartitioned is a rollup
        (_, PartitionDimension::None) => Ok(PartitionMapping::AllPartitions),

        _ => Err(PartitionMappingError::IncompatibleTypes {
            upstream: upstream.kind_name().to_string(),
            downstream: downstream.kind_name().to_string(),
            mapping: "inferred".to_string(),
        }),
    }
}
