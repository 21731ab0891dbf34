//! Source fetcher reading JSON files from a local directory
//!
//! Each source is a file `<root>/<source_id>.json` holding an array of
//! objects. The whole file is returned on every fetch; the `source` compute
//! narrows it to the partition day through its `timestamp_field`.

use async_trait::async_trait;
use runway_core::{FetchError, Row, SourceFetcher, Watermark};
use std::path::PathBuf;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct DirectorySourceFetcher {
    root: PathBuf,
}

impl DirectorySourceFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn source_path(&self, source_id: &str) -> Result<PathBuf, FetchError> {
        let valid = !source_id.is_empty()
            && source_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(FetchError::Permanent(format!(
                "invalid source id '{}'",
                source_id
            )));
        }
        Ok(self.root.join(format!("{}.json", source_id)))
    }
}

#[async_trait]
impl SourceFetcher for DirectorySourceFetcher {
    #[instrument(skip(self, watermark), fields(root = %self.root.display()))]
    async fn fetch(&self, source_id: &str, watermark: &Watermark) -> Result<Vec<Row>, FetchError> {
        let path = self.source_path(source_id)?;

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::Permanent(format!(
                    "unknown source '{}': {} does not exist",
                    source_id,
                    path.display()
                )));
            }
            Err(e) => {
                return Err(FetchError::Transient(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let rows: Vec<Row> = serde_json::from_slice(&bytes).map_err(|e| {
            FetchError::Permanent(format!("malformed source file {}: {}", path.display(), e))
        })?;

        debug!(
            rows = rows.len(),
            partition_date = ?watermark.partition_date,
            "Fetched source rows"
        );
        Ok(rows)
    }
}
