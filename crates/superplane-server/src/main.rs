use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use superplane::CoreBuilder;
use superplane_postgres::{PgPolicyStore, PgStore};
use superplane_server::{app, telemetry, AppState, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    telemetry::init(config.log_format);

    let store = PgStore::connect(&config.database_url, config.db_pool_size)
        .await
        .context("failed to connect to database")?;
    store.migrate().await.context("failed to apply migrations")?;
    let policies = PgPolicyStore::new(store.pool().clone());

    let core = CoreBuilder::new(
        Arc::new(store),
        Arc::new(policies),
        config.encryptor()?,
        config.jwt_secret.as_bytes(),
    )
    .with_executor_config(config.executor_config())
    .with_enforcer_config(config.enforcer_config())
    .build()
    .await
    .context("failed to build core")?;
    let core = Arc::new(core);

    let shutdown = CancellationToken::new();
    let workers = core.start(shutdown.clone()).context("failed to start workers")?;
    info!(worker_id = core.worker_id(), workers = workers.len(), "workers started");

    let listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    info!(addr = %config.http_addr, "listening");

    let router = app(AppState::new(core.clone(), &config.base_url));
    let signal = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutting down");
            signal.cancel();
        })
        .await
        .context("http server failed")?;

    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "worker exited abnormally");
        }
    }
    Ok(())
}
