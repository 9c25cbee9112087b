//! Stockroom archiver - archive and purge job
//!
//! # Usage
//!
//! ```bash
//! # Count what would be archived
//! stockroom-archiver
//!
//! # Archive and purge for real
//! stockroom-archiver --commit --batch-size 500
//! ```
//!
//! # Exit codes
//!
//! - `0` - run finished (dry-run or commit)
//! - `1` - run finished with errors
//! - `2` - maintenance lease held by another run
//! - `3` - startup failure (configuration or connection)

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shared::RunOutcome;
use stockroom::services::archival::{ArchivalJob, ArchivalSettings};
use stockroom::store::{ArchiveStore, MemoryStore, PgStore};
use stockroom::Config;

#[derive(Parser)]
#[command(name = "stockroom-archiver")]
#[command(author, version, about = "Archive aged inventory rows and purge old audit entries")]
struct Cli {
    /// Apply changes (default is a dry run that only counts)
    #[arg(long)]
    commit: bool,

    /// Rows moved per batch
    #[arg(long)]
    batch_size: Option<u32>,

    /// Name of the maintenance lease
    #[arg(long)]
    lock_key: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stockroom=info,stockroom_archiver=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            return ExitCode::from(3);
        }
    };

    let store: Arc<dyn ArchiveStore> = if config.database.is_memory() {
        tracing::warn!("Archiving the in-memory store; nothing persists between processes");
        Arc::new(MemoryStore::new())
    } else {
        match PgStore::connect(&config.database).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to database");
                return ExitCode::from(3);
            }
        }
    };

    let mut settings = ArchivalSettings::from_config(&config.archival);
    if let Some(batch_size) = cli.batch_size {
        settings.batch_size = batch_size;
    }
    if let Some(lock_key) = cli.lock_key {
        settings.lease_name = lock_key;
    }
    if settings.batch_size == 0 {
        tracing::error!("--batch-size must be at least 1");
        return ExitCode::from(3);
    }

    tracing::info!(
        commit = cli.commit,
        batch_size = settings.batch_size,
        lease = %settings.lease_name,
        "Starting archive and purge"
    );

    let job = ArchivalJob::new(store, settings);
    let report = job.run(!cli.commit).await;

    match report.outcome {
        RunOutcome::Completed | RunOutcome::DryRun => ExitCode::SUCCESS,
        RunOutcome::Failed => ExitCode::from(1),
        RunOutcome::LockUnavailable => ExitCode::from(2),
    }
}
