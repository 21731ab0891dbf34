//! Database models for the partition catalog

use chrono::{DateTime, Utc};
use runway_core::{
    DataQualityResult, Fingerprint, PartitionKey, PartitionRecord, PartitionRef, PartitionState,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Row of the `runway_partitions` table
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PartitionModel {
    pub asset: String,
    pub partition_key: String,
    pub state: String,
    pub input_fingerprint: String,
    pub output_fingerprint: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub row_count: Option<i64>,
    pub quality_results: sqlx::types::Json<Vec<DataQualityResult>>,
    pub blocked_by_asset: Option<String>,
    pub blocked_by_key: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&PartitionRecord> for PartitionModel {
    fn from(record: &PartitionRecord) -> Self {
        let (blocked_by_asset, blocked_by_key) = match &record.blocked_by {
            Some(upstream) => (
                Some(upstream.asset.clone()),
                Some(upstream.key.as_str().to_string()),
            ),
            None => (None, None),
        };

        Self {
            asset: record.asset.clone(),
            partition_key: record.key.as_str().to_string(),
            state: record.state.as_str().to_string(),
            input_fingerprint: record.input_fingerprint.as_str().to_string(),
            output_fingerprint: record
                .output_fingerprint
                .as_ref()
                .map(|fp| fp.as_str().to_string()),
            last_success_at: record.last_success_at,
            row_count: record.row_count.map(|n| n as i64),
            quality_results: sqlx::types::Json(record.quality_results.clone()),
            blocked_by_asset,
            blocked_by_key,
            updated_at: record.updated_at,
        }
    }
}

impl TryFrom<PartitionModel> for PartitionRecord {
    type Error = crate::Error;

    fn try_from(model: PartitionModel) -> Result<Self, Self::Error> {
        let state: PartitionState = model
            .state
            .parse()
            .map_err(|e: runway_core::partition::ParseStateError| {
                crate::Error::Corrupt(format!(
                    "{}[{}]: {}",
                    model.asset, model.partition_key, e
                ))
            })?;

        let row_count = match model.row_count {
            Some(n) if n < 0 => {
                return Err(crate::Error::Corrupt(format!(
                    "{}[{}]: negative row count {}",
                    model.asset, model.partition_key, n
                )))
            }
            Some(n) => Some(n as u64),
            None => None,
        };

        let blocked_by = match (model.blocked_by_asset, model.blocked_by_key) {
            (Some(asset), Some(key)) => Some(PartitionRef::new(asset, key)),
            _ => None,
        };

        Ok(PartitionRecord {
            asset: model.asset,
            key: PartitionKey::new(model.partition_key),
            state,
            input_fingerprint: Fingerprint::from_hex(model.input_fingerprint),
            output_fingerprint: model.output_fingerprint.map(Fingerprint::from_hex),
            last_success_at: model.last_success_at,
            row_count,
            quality_results: model.quality_results.0,
            blocked_by,
            updated_at: model.updated_at,
        })
    }
}
