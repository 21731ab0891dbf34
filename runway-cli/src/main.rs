//! Runway CLI tool

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

mod commands;
mod config;
mod sources;

/// Exit code for configuration and graph errors
const EXIT_CONFIG_ERROR: i32 = 2;

#[derive(Parser)]
#[command(name = "runway")]
#[command(author, version, about = "Incremental materialization engine for partitioned data assets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Pipeline definition file
    #[arg(short, long, global = true, env = "RUNWAY_CONFIG", default_value = "runway.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Materialize stale partitions of the selected assets
    Materialize {
        /// Asset selection, e.g. "raw_*", "+daily_metrics" or "group:cleaned"
        #[arg(long, default_value = "*")]
        select: String,

        /// Partition key or inclusive range START..END
        #[arg(long)]
        partition: Option<String>,
    },

    /// Re-materialize historical partitions
    Backfill {
        /// Asset selection
        #[arg(long)]
        select: String,

        /// First partition key (inclusive)
        #[arg(long)]
        from: String,

        /// Last partition key (inclusive)
        #[arg(long)]
        to: String,

        /// Rebuild every partition in range, not only missing ones
        #[arg(long)]
        force: bool,

        /// Do not extend a forced backfill to downstream partitions
        #[arg(long)]
        no_propagate: bool,
    },

    /// List assets in the pipeline
    ListAssets,

    /// List catalog state of an asset's partitions
    ListPartitions {
        /// Asset name
        #[arg(long)]
        asset: String,

        /// First partition key (inclusive)
        #[arg(long)]
        from: Option<String>,

        /// Last partition key (inclusive)
        #[arg(long)]
        to: Option<String>,
    },

    /// Apply catalog schema migrations (PostgreSQL catalog only)
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let definition = match config::load_definition(&cli.config) {
        Ok(definition) => definition,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let result = match cli.command {
        Commands::Materialize { select, partition } => {
            commands::materialize::execute(definition, &select, partition.as_deref(), cancel).await
        }
        Commands::Backfill {
            select,
            from,
            to,
            force,
            no_propagate,
        } => {
            let args = commands::backfill::BackfillArgs {
                select,
                from,
                to,
                force,
                propagate: !no_propagate,
            };
            commands::backfill::execute(definition, &args, cancel).await
        }
        Commands::ListAssets => commands::list::list_assets(&definition).map(|_| 0),
        Commands::ListPartitions { asset, from, to } => {
            commands::list::list_partitions(&definition, &asset, from.as_deref(), to.as_deref())
                .await
                .map(|_| 0)
        }
        Commands::Migrate => commands::migrate::execute(&definition.settings)
            .await
            .map(|_| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(commands::exit_code_for(&e));
        }
    }
}
