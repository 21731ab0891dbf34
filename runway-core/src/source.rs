//! External source contract
//!
//! Source assets pull records from an upstream provider (flight schedules,
//! weather observations, airport reference data). The fetcher is handed the
//! last confirmed watermark so providers that support it can return only new
//! records.

use crate::partition::Row;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Last externally confirmed position consumed from a source feed
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Watermark {
    /// Partition day being fetched, when the asset is daily
    pub partition_date: Option<NaiveDate>,

    /// Newest record timestamp already committed for this partition
    pub since: Option<DateTime<Utc>>,
}

impl Watermark {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Errors returned by a source fetcher
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Timeouts, rate limits and 5xx responses
    #[error("Transient fetch failure: {0}")]
    Transient(String),

    /// Bad credentials, unknown feed, malformed payload
    #[error("Permanent fetch failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Pulls rows from an external provider
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source_id: &str, watermark: &Watermark) -> Result<Vec<Row>, FetchError>;
}
