// Worker host: runs N invocation workers against the shared queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use work_service::capture::{BlobCaptureFactory, CaptureFactory, FsBlobStore, MemoryCaptureFactory};
use work_service::{
    Clock, JobRegistry, PostgresInvocationStore, SystemClock, WorkConfig, WorkService,
    WorkServiceConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,work_service=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting registry work service");

    let config = WorkConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(instance = %config.instance_name, workers = config.worker_count, "Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(PostgresInvocationStore::with_lease_cap(
        pool,
        clock.clone(),
        config.lease_cap,
    ));

    // Concrete jobs are deployment plug-ins; register them here before
    // starting the service.
    let registry = Arc::new(JobRegistry::new());

    let captures: Arc<dyn CaptureFactory> = match &config.log_root {
        Some(root) => {
            tracing::info!(root = %root.display(), "Capturing invocation logs to blob store");
            Arc::new(BlobCaptureFactory::new(
                Arc::new(FsBlobStore::new(root.clone())),
                clock.clone(),
            ))
        }
        None => {
            tracing::warn!("WORK_LOG_ROOT unset; invocation logs will not be persisted");
            Arc::new(MemoryCaptureFactory::new(clock.clone()))
        }
    };

    let service = WorkService::new(
        WorkServiceConfig {
            instance_name: config.instance_name.clone(),
            worker_count: config.worker_count,
            poll_interval: config.poll_interval,
            invisibility: config.invisibility,
        },
        store,
        registry,
        captures,
        clock,
    );

    service.run_until_shutdown().await
}
