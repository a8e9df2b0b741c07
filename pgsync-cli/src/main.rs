//! `pgsync` — the operational binary around `pgsync-core`.
//!
//! Deliberately thin: config/env loading and connection construction
//! live here; the pipeline itself lives in the library crate. Mirrors
//! the split between a library and its own driver binary seen elsewhere
//! in this codebase's sibling crates.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use deadpool_postgres::{Config as PoolConfig, Runtime};

use pgsync_core::checkpoint::FileCheckpointStore;
use pgsync_core::config::Settings;
use pgsync_core::context::Context;
use pgsync_core::coordinator::Coordinator;
use pgsync_core::error::SyncError;
use pgsync_core::indexer::BulkIndexer;
use pgsync_core::publish::ChannelPublishSource;
use pgsync_core::schema::SchemaTree;
use pgsync_core::slot::SlotManager;

#[derive(Parser)]
#[command(name = "pgsync", version, about = "Mirror PostgreSQL tables into denormalized search documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate prerequisites, bootstrap if needed, then stream changes.
    Sync {
        #[arg(short, long, value_name = "FILE")]
        config: std::path::PathBuf,
    },
    /// Run a one-shot full scan and index of every root document.
    Bootstrap {
        #[arg(short, long, value_name = "FILE")]
        config: std::path::PathBuf,
    },
    /// Drop the replication slot for this sync descriptor.
    Teardown {
        #[arg(short, long, value_name = "FILE")]
        config: std::path::PathBuf,
        /// Also drop the underlying database (destructive, for ephemeral
        /// test/CI databases only).
        #[arg(long)]
        drop_db: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Sync { config } => run_sync(config).await,
        Command::Bootstrap { config } => run_bootstrap(config).await,
        Command::Teardown { config, drop_db } => run_teardown(config, drop_db).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "pgsync exiting");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn load(config_path: std::path::PathBuf) -> Result<(Settings, SchemaTree), SyncError> {
    let raw = std::fs::read_to_string(&config_path)
        .map_err(|e| SyncError::Config(format!("reading {} failed: {e}", config_path.display())))?;
    let file: pgsync_core::config::ConfigFile = serde_json::from_str(&raw)
        .map_err(|e| SyncError::Config(format!("{} is not a valid pgsync config: {e}", config_path.display())))?;

    let sync_doc = file.sync.clone();
    let mut settings = file.into_settings();
    settings.apply_env_overrides();

    init_tracing(&settings.operational.log_level);

    let tree = SchemaTree::from_document(&sync_doc)?;
    Ok((settings, tree))
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn build_pool(settings: &Settings) -> Result<deadpool_postgres::Pool, SyncError> {
    let mut cfg = PoolConfig::new();
    cfg.host = Some(settings.database.host.clone());
    cfg.port = Some(settings.database.port);
    cfg.user = Some(settings.database.user.clone());
    cfg.password = Some(settings.database.password.clone());
    cfg.dbname = Some(settings.database.name.clone());
    cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)
        .map_err(|e| SyncError::Config(format!("building connection pool failed: {e}")))
}

/// Assemble the runtime context every component is built from: no
/// constructor below this point reaches for a global pool or client.
async fn build_context(settings: Settings) -> Result<Context, SyncError> {
    let pool = build_pool(&settings).await?;
    let http_client = reqwest::Client::new();
    Ok(Context::new(settings, pool, http_client))
}

async fn connect_single(settings: &Settings) -> Result<tokio_postgres::Client, SyncError> {
    let (client, connection) = tokio_postgres::connect(&settings.database_url(), tokio_postgres::NoTls)
        .await
        .map_err(|e| SyncError::Replication(format!("connecting to postgres failed: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "postgres connection task ended");
        }
    });
    Ok(client)
}

async fn run_bootstrap(config_path: std::path::PathBuf) -> Result<(), SyncError> {
    let (settings, mut tree) = load(config_path).await?;
    let slot_client = connect_single(&settings).await?;
    let context = build_context(settings).await?;
    tree.resolve_primary_keys(&context.pool).await?;

    let coordinator = make_coordinator(&context, tree, slot_client).await?;
    coordinator.validate().await?;
    coordinator.bootstrap().await?;
    coordinator.persist_checkpoint_now().await;
    Ok(())
}

async fn run_sync(config_path: std::path::PathBuf) -> Result<(), SyncError> {
    let (settings, mut tree) = load(config_path).await?;
    let slot_client = connect_single(&settings).await?;
    let context = build_context(settings).await?;
    tree.resolve_primary_keys(&context.pool).await?;

    let coordinator = Arc::new(make_coordinator(&context, tree, slot_client).await?);

    let cancellation = context.cancellation.clone();
    tokio::spawn({
        let cancellation = cancellation.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            cancellation.cancel();
        }
    });

    let (_tx, rx) = tokio::sync::mpsc::channel(64);
    let publish_source = Box::new(ChannelPublishSource::new(rx));

    coordinator.run(publish_source).await
}

async fn run_teardown(config_path: std::path::PathBuf, drop_db: bool) -> Result<(), SyncError> {
    let (settings, tree) = load(config_path).await?;
    let slot_client = connect_single(&settings).await?;
    let slot_manager = SlotManager::new(slot_client);

    let database = tree.database.clone().unwrap_or_else(|| settings.database.name.clone());
    let slot_name = SlotManager::slot_name(&database, &tree.index);
    if slot_manager.exists(&slot_name).await? {
        slot_manager.drop(&slot_name).await?;
    }

    if drop_db {
        tracing::warn!(database = %database, "dropping database as requested by --drop-db");
        let admin = connect_single(&settings).await?;
        admin
            .execute(&format!("DROP DATABASE IF EXISTS {database}"), &[])
            .await
            .map_err(|e| SyncError::Fatal(format!("dropping database {database} failed: {e}")))?;
    }

    Ok(())
}

async fn make_coordinator(
    context: &Context,
    tree: SchemaTree,
    slot_client: tokio_postgres::Client,
) -> Result<Coordinator<SlotManager>, SyncError> {
    let settings = &context.settings;
    let database = tree.database.clone().unwrap_or_else(|| settings.database.name.clone());
    let slot_manager = SlotManager::new(slot_client);
    let slot_name = SlotManager::slot_name(&database, &tree.index);
    slot_manager.create(&slot_name).await?;

    let builder = pgsync_core::builder::DocumentBuilder::new(context.pool.clone());
    let indexer = BulkIndexer::new(context.http_client.clone(), settings.index.endpoint.clone());
    let checkpoint_store = Arc::new(FileCheckpointStore::new("pgsync-checkpoint.json"));

    Ok(Coordinator::new(
        tree,
        database,
        slot_manager,
        builder,
        indexer,
        checkpoint_store,
        context.pool.clone(),
        settings.operational.logical_slot_chunk_size,
        settings.operational.batch_size,
        settings.operational.poll_interval,
        settings.operational.checkpoint_interval,
        context.child_cancellation(),
    ))
}
