//! CLI configuration management

use anyhow::{Context, Result};
use runway_core::{CatalogSettings, ConfigError, PipelineConfig, PipelineDefinition, Settings};
use runway_storage::{FileCatalog, InMemoryCatalog, PartitionCatalog, PoolConfig, PostgresCatalog};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Load the pipeline file and apply environment overrides
pub fn load_definition(path: &Path) -> Result<PipelineDefinition> {
    let mut config = PipelineConfig::from_path(path)?;
    apply_overrides(&mut config.settings, |name| std::env::var(name).ok())?;
    let definition = config.build()?;

    debug!(
        path = %path.display(),
        assets = definition.graph.len(),
        "Loaded pipeline definition"
    );
    Ok(definition)
}

/// Apply `DATABASE_URL`, `RUNWAY_CONCURRENCY` and `RUNWAY_DATA_DIR`
pub fn apply_overrides<F>(settings: &mut Settings, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup("RUNWAY_CONCURRENCY") {
        settings.concurrency = value.trim().parse().map_err(|_| {
            ConfigError::InvalidSetting(format!(
                "RUNWAY_CONCURRENCY must be a positive integer, got '{}'",
                value
            ))
        })?;
    }

    if let Some(dir) = lookup("RUNWAY_DATA_DIR") {
        settings.data_dir = PathBuf::from(dir);
    }

    if let CatalogSettings::Postgres { url, .. } = &mut settings.catalog {
        if url.is_none() {
            *url = lookup("DATABASE_URL");
        }
    }

    Ok(())
}

/// Open the partition catalog named in the settings
pub async fn open_catalog(settings: &Settings) -> Result<Arc<dyn PartitionCatalog>> {
    match &settings.catalog {
        CatalogSettings::Memory => {
            info!("Using in-memory catalog; state is discarded on exit");
            Ok(Arc::new(InMemoryCatalog::new()))
        }
        CatalogSettings::File { path } => {
            let catalog = FileCatalog::open(path)
                .await
                .with_context(|| format!("Failed to open catalog {}", path.display()))?;
            Ok(Arc::new(catalog))
        }
        CatalogSettings::Postgres { .. } => {
            let catalog = connect_postgres(settings).await?;
            catalog.migrate().await?;
            Ok(Arc::new(catalog))
        }
    }
}

/// Connect to the PostgreSQL catalog without migrating
pub async fn connect_postgres(settings: &Settings) -> Result<PostgresCatalog> {
    let CatalogSettings::Postgres {
        url,
        max_connections,
    } = &settings.catalog
    else {
        anyhow::bail!("the configured catalog is not PostgreSQL");
    };

    let url = url
        .as_deref()
        .ok_or_else(|| ConfigError::InvalidSetting("DATABASE_URL not set".to_string()))?;
    let pool = PoolConfig::default().with_max_connections(*max_connections);
    let catalog = PostgresCatalog::with_pool_config(url, pool)
        .await
        .context("Failed to connect to the PostgreSQL catalog")?;
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_concurrency_override() {
        let mut settings = Settings::default();
        apply_overrides(&mut settings, env(&[("RUNWAY_CONCURRENCY", "8")])).unwrap();
        assert_eq!(settings.concurrency, 8);
    }

    #[test]
    fn test_invalid_concurrency_is_config_error() {
        let mut settings = Settings::default();
        let err = apply_overrides(&mut settings, env(&[("RUNWAY_CONCURRENCY", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting(_)));
    }

    #[test]
    fn test_database_url_fills_missing_postgres_url() {
        let mut settings = Settings {
            catalog: CatalogSettings::Postgres {
                url: None,
                max_connections: 5,
            },
            ..Settings::default()
        };
        apply_overrides(&mut settings, env(&[("DATABASE_URL", "postgres://localhost/runway")]))
            .unwrap();

        assert_eq!(
            settings.catalog,
            CatalogSettings::Postgres {
                url: Some("postgres://localhost/runway".to_string()),
                max_connections: 5,
            }
        );
    }

    #[test]
    fn test_explicit_postgres_url_wins() {
        let mut settings = Settings {
            catalog: CatalogSettings::Postgres {
                url: Some("postgres://db/prod".to_string()),
                max_connections: 5,
            },
            ..Settings::default()
        };
        apply_overrides(&mut settings, env(&[("DATABASE_URL", "postgres://localhost/other")]))
            .unwrap();

        assert!(matches!(
            settings.catalog,
            CatalogSettings::Postgres { url: Some(ref u), .. } if u == "postgres://db/prod"
        ));
    }

    #[test]
    fn test_data_dir_override() {
        let mut settings = Settings::default();
        apply_overrides(&mut settings, env(&[("RUNWAY_DATA_DIR", "/tmp/runway")])).unwrap();
        assert_eq!(settings.data_dir, PathBuf::from("/tmp/runway"));
    }

    #[tokio::test]
    async fn test_open_file_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            catalog: CatalogSettings::File {
                path: dir.path().join("catalog.json"),
            },
            ..Settings::default()
        };

        let catalog = open_catalog(&settings).await.unwrap();
        let record = catalog
            .get(&runway_core::PartitionRef::new("raw_flights", "2024-03-01"))
            .await
            .unwrap();
        assert!(record.is_none());
    }
}
