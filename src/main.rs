use std::sync::Arc;

use actix_web::web;
use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod cache;
mod config;
mod db;
mod messaging;
mod metrics;
mod models;
mod utils;

use cache::OrderCache;
use config::Config;
use db::{OrderStore, PgOrderStore};
use messaging::OrderConsumer;
use metrics::Metrics;
use utils::{retry_with_backoff, RetryConfig, RetryResult};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Structured logging with environment-based filtering.
    // Override with RUST_LOG, e.g. RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,orderstream=debug")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!(
        topic = %config.kafka.topic,
        group_id = %config.kafka.group_id,
        http_addr = %config.http_addr,
        "Starting orderstream"
    );

    // === 1. Connect to Postgres (with backoff, then fatal) ===
    let store = match retry_with_backoff(RetryConfig::default(), |_attempt| {
        PgOrderStore::connect(&config.database_url)
    })
    .await
    {
        RetryResult::Success(store) => store,
        RetryResult::Failed(e) => {
            return Err(e).context("could not connect to the database");
        }
    };

    store.migrate().await.context("database migration failed")?;
    let store: Arc<dyn OrderStore> = Arc::new(store);

    // === 2. Warm the cache from the store before serving traffic ===
    let cache = Arc::new(OrderCache::new());
    let orders = store
        .get_all()
        .await
        .context("could not load orders for the cache warm-up")?;
    cache.load(orders);
    tracing::info!(orders_loaded = cache.len(), "Cache restored from store");

    let metrics = Arc::new(Metrics::new()?);

    // === 3. Start the Kafka consumer ===
    let shutdown = CancellationToken::new();
    let consumer = OrderConsumer::new(
        &config.kafka,
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&metrics),
    )
    .context("could not create the Kafka consumer")?;
    let consumer_task = tokio::spawn(consumer.run(shutdown.clone()));

    // === 4. Start the read API ===
    let query_service = web::Data::new(api::QueryService::new(
        Arc::clone(&cache),
        Arc::clone(&store),
        Arc::clone(&metrics),
    ));
    let registry = Arc::new(metrics.registry().clone());
    let server = api::build_server(&config.http_addr, query_service, registry)
        .context("could not bind the HTTP server")?;
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tracing::info!("Service started");

    // === 5. Wait for SIGINT/SIGTERM, then shut down in order ===
    shutdown_signal().await;
    tracing::info!("Shutting down");

    shutdown.cancel();
    server_handle.stop(true).await;

    consumer_task.await.context("consumer task panicked")?;
    server_task.await.context("server task panicked")??;

    tracing::info!("Service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
