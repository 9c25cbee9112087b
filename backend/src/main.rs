//! Stockroom - HTTP server
//!
//! Serves the inventory core over JSON and, when configured, runs the
//! periodic alert watcher.

use std::{net::SocketAddr, sync::Arc};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockroom::services::{AlertWatcher, ReportingService, WebhookNotifier};
use stockroom::store::{MemoryStore, PgStore, Store};
use stockroom::{create_app, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stockroom=debug,tower_http=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::load()?;

    tracing::info!("Starting Stockroom server");
    tracing::info!("Environment: {}", config.environment);

    let store: Arc<dyn Store> = if config.database.is_memory() {
        tracing::warn!("Using the in-memory store; data is lost on exit");
        Arc::new(MemoryStore::with_default_catalog())
    } else {
        tracing::info!("Connecting to database...");
        let store = PgStore::connect(&config.database).await?;
        tracing::info!("Database connection established");
        Arc::new(store)
    };

    let notifier = WebhookNotifier::from_config(&config.notifications)?;

    // Background alert watcher
    match (&notifier, config.alerts.watch_products.is_empty()) {
        (Some(notifier), false) => {
            let watcher = AlertWatcher::new(
                ReportingService::new(store.clone()),
                notifier.clone(),
                &config.alerts,
            );
            tokio::spawn(watcher.run());
        }
        (None, false) => {
            tracing::warn!("alerts.watch_products is set but no webhook is configured; watcher disabled");
        }
        _ => {}
    }

    let state = AppState {
        store,
        config: Arc::new(config.clone()),
        notifier,
    };

    let app = create_app(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
