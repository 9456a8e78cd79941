//! Courier notification delivery service.
//!
//! Main entry point for the Courier server. Initializes all subsystems,
//! starts the delivery pipeline, and coordinates graceful shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use courier_api::{AppState, Config};
use courier_core::{storage::Storage, RealClock};
use courier_pipeline::{
    controller::PipelineController,
    publish::Publisher,
    queue::{EventQueue, InMemoryQueue, RedisQueue},
    sender::HttpGatewaySender,
    store::PostgresDeliveryStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!("Starting Courier notification service");
    info!(
        database_url = %config.database_url_masked(),
        queue = config.redis_url.as_deref().map_or("in-memory", |_| "redis"),
        gateway_url = %config.gateway_url,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    let storage = Arc::new(Storage::new(db_pool.clone()));
    let store = Arc::new(PostgresDeliveryStore::new(storage));
    let clock = Arc::new(RealClock::new());

    let queue: Arc<dyn EventQueue> = match &config.redis_url {
        Some(url) => {
            let queue = RedisQueue::connect(url, &config.queue_key)
                .await
                .context("Failed to connect to Redis queue")?;
            info!(key = %config.queue_key, "Redis event queue connected");
            Arc::new(queue)
        },
        None => {
            info!("Using in-process event queue");
            Arc::new(InMemoryQueue::new())
        },
    };

    let sender = Arc::new(
        HttpGatewaySender::new(config.to_gateway_config())
            .context("Failed to build channel gateway client")?,
    );

    let controller = Arc::new(PipelineController::new(
        queue.clone(),
        store.clone(),
        sender,
        clock.clone(),
        config.to_pipeline_config(),
    ));
    controller.start().await;

    let publisher = Arc::new(Publisher::new(queue, clock.clone()));

    let state = AppState { store, controller: controller.clone(), publisher, clock };

    let server_addr = config.parse_server_addr()?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = courier_api::start_server(state, server_addr).await {
            error!(error = %e, "Server failed");
        }
    });

    info!(addr = %server_addr, "Courier is ready");

    // The server exits once it observes CTRL+C or SIGTERM.
    let _ = server_handle.await;
    info!("Shutdown signal received, stopping pipeline");

    if let Err(e) = controller.stop().await {
        error!(error = %e, "Pipeline did not stop cleanly");
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Courier shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{default_filter},courier=debug,tower_http=debug")))
        .expect("Invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                // Verify connection works
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Runs database migrations.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS delivery_records (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            event_id UUID NOT NULL UNIQUE,
            user_id UUID NOT NULL,
            kind TEXT NOT NULL,
            destination TEXT NOT NULL,
            subject TEXT,
            body TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            attempt_count INTEGER NOT NULL DEFAULT 0,
            next_retry_at TIMESTAMPTZ,
            last_error TEXT,
            provider_message_id TEXT,
            provider_response TEXT,
            payload JSONB NOT NULL,
            sent_at TIMESTAMPTZ,
            failed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create delivery_records table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_records_due
        ON delivery_records(status, next_retry_at)
        WHERE status = 'retrying'
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create delivery_records due index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_records_user
        ON delivery_records(user_id, created_at DESC)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create delivery_records user index")?;

    Ok(())
}
