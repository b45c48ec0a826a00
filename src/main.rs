//! fleetwatch hub: polls agents, raises alerts and keeps history.

use fleetwatch::alerts::{AlertManager, WebhookNotifier};
use fleetwatch::config::ServerConfig;
use fleetwatch::db::Store;
use fleetwatch::hub::{sync_from_dir, HubKeys};
use fleetwatch::records::RecordManager;
use fleetwatch::systems::SystemManager;
use fleetwatch::transport::AgentClient;
use fleetwatch::web::{AppState, Server};

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("fleetwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    std::fs::create_dir_all(&cfg.data_dir)?;
    tracing::info!("Starting fleetwatch hub on port {}...", cfg.http_port);
    tracing::info!("Using data directory {}", cfg.data_dir.display());

    // Initialize database
    let store = Arc::new(Store::new(cfg.db_path())?);
    tracing::info!("Database initialized successfully");

    let keys = HubKeys::load_or_generate(&cfg.data_dir)?;
    tracing::info!("Hub public key: {}", keys.public_key);

    if let Err(e) = sync_from_dir(&store, &cfg.data_dir) {
        tracing::error!("Failed to apply config.yml: {}", e);
    }

    let notifier = Arc::new(WebhookNotifier::new(store.clone()));
    let alerts = Arc::new(AlertManager::new(store.clone(), notifier.clone(), &cfg.app_url));
    alerts.start();

    // Windows settle once every poll that started inside them has finished.
    let records = RecordManager::new(
        store.clone(),
        cfg.raw_retention,
        cfg.poll_timeout + Duration::from_secs(3),
    );
    records.start();

    let client = AgentClient::new(Arc::new(keys.signing_key.clone()), cfg.poll_timeout);
    let systems = Arc::new(SystemManager::new(
        store.clone(),
        alerts.clone(),
        client,
        cfg.poll_interval,
        cfg.max_concurrent_polls,
    ));
    systems.start();

    let server = Server::new(AppState {
        config: cfg,
        store,
        public_key: keys.public_key,
        alerts: alerts.clone(),
        notifier,
    });
    server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    tracing::info!("Shutting down");
    systems.stop().await;
    records.stop();
    alerts.stop();

    Ok(())
}
