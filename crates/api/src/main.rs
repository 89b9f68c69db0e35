//! Courier admin API server binary entrypoint.
//!
//! Serves the broadcast admin routes and runs the queue and purge schedules
//! in-process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use courier_common::config::AppConfig;
use courier_common::db::{create_pool, run_migrations};
use courier_engine::manager::RunManager;
use courier_engine::postgres::{PgBroadcastStore, PgSubscriberRegistry};
use courier_engine::processor::QueueProcessor;
use courier_engine::purger::RetentionPurger;
use courier_engine::scheduler::spawn_background_jobs;
use courier_notifier::TelegramGateway;

use courier_api::routes::create_router;
use courier_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("courier_api=debug,courier_engine=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Courier API server...");

    // Load configuration
    let config = AppConfig::from_env()?;
    let settings = config.broadcast.clone();

    // Create database connection pool
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

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

    // Background schedules
    let processor = QueueProcessor::new(store.clone(), gateway, registry, &settings);
    let purger = RetentionPurger::new(store.clone(), settings.retention());
    let (scheduler, trigger) = spawn_background_jobs(processor, purger, &settings);

    // Build application state
    let manager = RunManager::new(store, &settings).with_trigger(trigger);
    let state = AppState::new(manager);

    // Build router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    scheduler.shutdown().await;
    tracing::info!("Courier API server stopped.");
    Ok(())
}
