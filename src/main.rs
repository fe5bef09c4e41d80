//! pingtrail: time-bounded latency monitoring jobs behind a small HTTP API.

mod config;
mod db;
mod probe;
mod scheduler;
mod web;

use config::ServerConfig;
use db::Store;
use probe::NetworkProber;
use scheduler::{JobRegistry, RetentionManager, Scheduler, SchedulerConfig};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pingtrail=info".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting pingtrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}, exports in {}", cfg.db_path, cfg.export_dir);

    let store = Arc::new(Store::new(&cfg.db_path, cfg.export_dir.as_str())?);
    tracing::info!("Database initialized successfully");

    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig {
            max_concurrent_jobs: cfg.max_concurrent_jobs,
            ..SchedulerConfig::default()
        },
        JobRegistry::new().shared(),
        store.clone(),
        Arc::new(NetworkProber),
    ));

    RetentionManager::sweep(&scheduler, cfg.startup_retention_days).await;
    let retention = RetentionManager::new(scheduler.clone(), cfg.retention_days, cfg.cleanup_interval);
    retention.start();

    let server = Server::new(cfg, store, scheduler);
    let result = server.start().await;

    retention.stop();
    result
}
