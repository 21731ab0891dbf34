//! Migrate command

use anyhow::Result;
use runway_core::{CatalogSettings, Settings};

pub async fn execute(settings: &Settings) -> Result<()> {
    if !matches!(settings.catalog, CatalogSettings::Postgres { .. }) {
        tracing::info!("Catalog is not PostgreSQL, nothing to migrate");
        return Ok(());
    }

    let catalog = crate::config::connect_postgres(settings).await?;
    runway_storage::migrations::run_migrations(catalog.pool()).await?;
    tracing::info!("Migrations applied successfully");
    println!("Catalog schema is up to date");
    Ok(())
}
