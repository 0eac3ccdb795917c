//! Aggregator Storage Admin Tool
//!
//! Brings the database schema to its latest version and checks that the storage can be
//! initialized. The aggregator service expects `migrate` to have run before it starts.
//!
//! # Environment Variables
//!
//! - `AGGREGATOR_STORAGE_CONFIG`: Path of the TOML config file (default: config.toml)
//! - `RUST_LOG`: Log level (default: info)
//!
//! # Example
//!
//! ```bash
//! cat > config.toml <<EOF
//! [storage]
//! backend = "sqlite"
//! data_source = "./data/aggregator.db"
//! EOF
//!
//! aggregator-storage migrate
//! aggregator-storage check
//! ```

use aggregator_storage::{Config, DbStorage, Storage};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "aggregator-storage")]
#[command(about = "Aggregator storage administration", long_about = None)]
struct Cli {
    /// Config file; overrides AGGREGATOR_STORAGE_CONFIG
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all pending schema migrations
    Migrate,
    /// Initialize the storage and print a summary of its contents
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .parse()
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path),
        None => Config::load_from_env("config.toml"),
    }
    .context("Failed to load configuration")?;

    info!("Configuration:");
    info!("  Backend: {}", config.storage.backend);
    info!("  Log queries: {}", config.storage.log_queries);

    let storage = DbStorage::new(&config.storage)
        .await
        .context("Failed to connect to data storage")?;

    let outcome = match cli.command {
        Commands::Migrate => migrate(&storage).await,
        Commands::Check => check(&storage).await,
    };

    storage.close().await;
    outcome
}

async fn migrate(storage: &DbStorage) -> Result<()> {
    storage
        .migrate_to_latest()
        .await
        .context("Failed to migrate database schema")?;
    info!("✓ Database schema is at the latest version");
    Ok(())
}

async fn check(storage: &DbStorage) -> Result<()> {
    storage
        .init()
        .await
        .context("Failed to initialize storage; has the schema been migrated?")?;

    let reports = storage.reports_count().await?;
    let orgs = storage.list_orgs().await?;
    let offset = storage.latest_kafka_offset().await?;
    let cache = storage.staleness_cache().stats().await;

    println!("Reports:         {}", reports);
    println!("Organizations:   {}", orgs.len());
    println!("Latest offset:   {}", offset);
    println!("Cached clusters: {}", cache.entries);
    Ok(())
}
