//! Courier broadcast worker.
//!
//! Runs the queue and purge schedules without the admin API. Any number of
//! workers can share one database; run and delivery leases keep them from
//! sending the same message twice.

use std::sync::Arc;
use std::time::Duration;

use courier_common::config::AppConfig;
use courier_common::db;
use courier_engine::postgres::{PgBroadcastStore, PgSubscriberRegistry};
use courier_engine::processor::QueueProcessor;
use courier_engine::purger::RetentionPurger;
use courier_engine::scheduler::spawn_background_jobs;
use courier_notifier::TelegramGateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_worker=info,courier_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;
    let settings = config.broadcast.clone();

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let token = config
        .telegram_bot_token
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("TELEGRAM_BOT_TOKEN environment variable is required"))?;
    let gateway = Arc::new(TelegramGateway::new(
        &config.telegram_api_base,
        token,
        Duration::from_secs(config.telegram_timeout_secs),
    )?);

    let store = Arc::new(PgBroadcastStore::new(
        pool.clone(),
        settings.vip_min_orders,
        settings.insert_chunk_size,
    ));
    let registry = Arc::new(PgSubscriberRegistry::new(pool));

    let processor = QueueProcessor::new(store.clone(), gateway, registry, &settings);
    let purger = RetentionPurger::new(store, settings.retention());
    let (scheduler, _trigger) = spawn_background_jobs(processor, purger, &settings);

    // Run until Ctrl+C
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    scheduler.shutdown().await;
    tracing::info!("Courier worker stopped.");
    Ok(())
}
