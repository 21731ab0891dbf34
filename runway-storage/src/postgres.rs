//! PostgreSQL partition catalog

use crate::catalog::{complete_snapshot, PartitionCatalog, StateChange};
use crate::models::PartitionModel;
use crate::{metrics, Result};
use async_trait::async_trait;
use chrono::Utc;
use runway_core::{KeyRange, PartitionKey, PartitionRecord, PartitionRef, UNPARTITIONED_KEY};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, error, instrument, warn};

const BACKEND: &str = "postgres";

const PARTITION_COLUMNS: &str = "asset, partition_key, state, input_fingerprint, \
     output_fingerprint, last_success_at, row_count, quality_results, \
     blocked_by_asset, blocked_by_key, updated_at";

/// Configuration for the PostgreSQL connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    pub max_lifetime_secs: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout_secs: 30,
            idle_timeout_secs: None,
            max_lifetime_secs: None,
        }
    }
}

impl PoolConfig {
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.min_connections == 0 {
            return Err(crate::Error::ValidationError(
                "min_connections must be > 0".to_string(),
            ));
        }
        if self.max_connections == 0 || self.max_connections < self.min_connections {
            return Err(crate::Error::ValidationError(
                "max_connections must be >= min_connections and > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partition catalog stored in the `runway_partitions` table.
///
/// Every state change runs in its own transaction holding a row lock on the
/// partition, so concurrent writers to the same partition serialize.
#[derive(Debug, Clone)]
pub struct PostgresCatalog {
    pool: PgPool,
}

impl PostgresCatalog {
    /// Connect with the default pool configuration
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::with_pool_config(database_url, PoolConfig::default()).await
    }

    /// Connect using a PoolConfig
    pub async fn with_pool_config(database_url: &str, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let mut opts = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_secs));

        if let Some(idle) = config.idle_timeout_secs {
            opts = opts.idle_timeout(std::time::Duration::from_secs(idle));
        }
        if let Some(max_life) = config.max_lifetime_secs {
            opts = opts.max_lifetime(std::time::Duration::from_secs(max_life));
        }

        let pool = opts.connect(database_url).await.map_err(map_db_error)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        crate::migrations::run_migrations(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PartitionCatalog for PostgresCatalog {
    #[instrument(skip(self, change), fields(partition = %change.partition, state = %change.state))]
    async fn record_state(&self, change: StateChange) -> Result<PartitionRecord> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;

        // Make sure a row exists so the row lock below serializes first writes too
        sqlx::query(
            "INSERT INTO runway_partitions (asset, partition_key, state) \
             VALUES ($1, $2, 'missing') ON CONFLICT (asset, partition_key) DO NOTHING",
        )
        .bind(&change.partition.asset)
        .bind(change.partition.key.as_str())
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

        let current: PartitionModel = sqlx::query_as(&format!(
            "SELECT {} FROM runway_partitions \
             WHERE asset = $1 AND partition_key = $2 FOR UPDATE",
            PARTITION_COLUMNS
        ))
        .bind(&change.partition.asset)
        .bind(change.partition.key.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;

        let record = change.apply(Some(PartitionRecord::try_from(current)?), Utc::now());
        let model = PartitionModel::from(&record);

        sqlx::query(
            "UPDATE runway_partitions SET state = $3, input_fingerprint = $4, \
             output_fingerprint = $5, last_success_at = $6, row_count = $7, \
             quality_results = $8, blocked_by_asset = $9, blocked_by_key = $10, \
             updated_at = $11 \
             WHERE asset = $1 AND partition_key = $2",
        )
        .bind(&model.asset)
        .bind(&model.partition_key)
        .bind(&model.state)
        .bind(&model.input_fingerprint)
        .bind(&model.output_fingerprint)
        .bind(model.last_success_at)
        .bind(model.row_count)
        .bind(&model.quality_results)
        .bind(&model.blocked_by_asset)
        .bind(&model.blocked_by_key)
        .bind(model.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

        tx.commit().await.map_err(map_db_error)?;

        let elapsed = started.elapsed();
        if elapsed.as_millis() > 100 {
            warn!(
                duration_ms = elapsed.as_millis() as u64,
                "Slow catalog write detected"
            );
        }
        debug!("Recorded partition state");
        metrics::record_write(BACKEND, record.state.as_str());
        metrics::observe(BACKEND, "record_state", started);

        Ok(record)
    }

    async fn get(&self, partition: &PartitionRef) -> Result<Option<PartitionRecord>> {
        let started = Instant::now();
        let model: Option<PartitionModel> = sqlx::query_as(&format!(
            "SELECT {} FROM runway_partitions WHERE asset = $1 AND partition_key = $2",
            PARTITION_COLUMNS
        ))
        .bind(&partition.asset)
        .bind(partition.key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        metrics::observe(BACKEND, "get", started);
        model.map(PartitionRecord::try_from).transpose()
    }

    async fn list_page(
        &self,
        asset: &str,
        range: &KeyRange,
        after: Option<&PartitionKey>,
        limit: usize,
    ) -> Result<Vec<PartitionRecord>> {
        let started = Instant::now();
        let models: Vec<PartitionModel> = sqlx::query_as(&format!(
            "SELECT {} FROM runway_partitions \
             WHERE asset = $1 \
               AND ($2::text IS NULL OR partition_key > $2) \
               AND (partition_key = $3 \
                    OR (($4::text IS NULL OR partition_key >= $4) \
                        AND ($5::text IS NULL OR partition_key <= $5))) \
             ORDER BY partition_key \
             LIMIT $6",
            PARTITION_COLUMNS
        ))
        .bind(asset)
        .bind(after.map(|k| k.as_str().to_string()))
        .bind(UNPARTITIONED_KEY)
        .bind(range.start.as_ref().map(|k| k.as_str().to_string()))
        .bind(range.end.as_ref().map(|k| k.as_str().to_string()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        metrics::observe(BACKEND, "list_page", started);
        models.into_iter().map(PartitionRecord::try_from).collect()
    }

    async fn snapshot(
        &self,
        partitions: &[PartitionRef],
    ) -> Result<BTreeMap<PartitionRef, PartitionRecord>> {
        if partitions.is_empty() {
            return Ok(BTreeMap::new());
        }

        let started = Instant::now();
        let assets: Vec<String> = partitions.iter().map(|p| p.asset.clone()).collect();
        let keys: Vec<String> = partitions
            .iter()
            .map(|p| p.key.as_str().to_string())
            .collect();

        // One statement, so every record comes from the same MVCC snapshot
        let models: Vec<PartitionModel> = sqlx::query_as(&format!(
            "SELECT {} FROM runway_partitions \
             WHERE (asset, partition_key) IN \
                   (SELECT * FROM UNNEST($1::text[], $2::text[]))",
            PARTITION_COLUMNS
        ))
        .bind(&assets)
        .bind(&keys)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        let found = models
            .into_iter()
            .map(|model| {
                let record = PartitionRecord::try_from(model)?;
                Ok((record.partition_ref(), record))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        metrics::observe(BACKEND, "snapshot", started);
        Ok(complete_snapshot(partitions, found))
    }
}

fn map_db_error(err: sqlx::Error) -> crate::Error {
    match &err {
        sqlx::Error::PoolTimedOut => {
            error!(error = %err, "Connection pool timed out");
            return crate::Error::PoolExhausted("Connection pool timed out".to_string());
        }
        sqlx::Error::PoolClosed => {
            error!(error = %err, "Connection pool closed");
            return crate::Error::ConnectionFailed("Connection pool closed".to_string());
        }
        _ => {}
    }

    if let sqlx::Error::Database(db_err) = &err {
        if let Some(code) = db_err.code().as_deref() {
            match code {
                // check_violation - unknown state or negative row count
                "23514" => {
                    warn!(
                        error_code = code,
                        message = db_err.message(),
                        "CHECK constraint violation"
                    );
                    return crate::Error::ValidationError(format!(
                        "Constraint violation: {}",
                        db_err.message()
                    ));
                }
                // too_many_connections
                "53300" => {
                    error!(
                        error_code = code,
                        message = db_err.message(),
                        "Database connection limit reached"
                    );
                    return crate::Error::PoolExhausted(db_err.message().to_string());
                }
                "08006" | "08001" | "08003" | "08004" => {
                    error!(
                        error_code = code,
                        message = db_err.message(),
                        "Database connection failed"
                    );
                    return crate::Error::ConnectionFailed(db_err.message().to_string());
                }
                _ => {
                    error!(
                        error_code = code,
                        message = db_err.message(),
                        "Unexpected database error"
                    );
                }
            }
        }
    }

    error!(error = %err, "Database error");
    crate::Error::Database(err)
}
