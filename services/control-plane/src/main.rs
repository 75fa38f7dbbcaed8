//! batchfleet control plane
//!
//! Provisions batch pipelines on the cloud provider, admits them against
//! their organization's token budget, and delivers jobs to their workers.

use std::sync::Arc;

use anyhow::Result;
use batchfleet_control_plane::{
    api,
    bus::PubsubClient,
    config,
    db::{Database, MemoryStore, Store},
    orchestrator::{Collaborators, Orchestrator},
    refresh::RefreshWorker,
    remote::GcpGateway,
    state::AppState,
    tasks::{LocalTaskQueue, TaskWorker},
};
use batchfleet_reconcile::Backoff;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to BATCHFLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting batchfleet control plane");
    info!(listen_addr = %config.listen_addr, dev_mode = config.dev_mode, "Configuration loaded");

    let store: Arc<dyn Store> = match &config.database {
        Some(db_config) => {
            let db = match Database::connect(db_config).await {
                Ok(db) => db,
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };
            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }
            Arc::new(db.store())
        }
        None => {
            warn!("DATABASE_URL not set; using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let gateway = Arc::new(GcpGateway::new(config.gcp.clone())?);
    let pubsub = Arc::new(PubsubClient::new(config.pubsub.clone())?);
    let (queue, receiver) = LocalTaskQueue::new();

    let orchestrator = Arc::new(Orchestrator::new(
        Collaborators {
            store,
            gateway,
            publisher: pubsub.clone(),
            progress: pubsub,
            scheduler: Arc::new(queue.clone()),
        },
        config.settings,
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task_worker = TaskWorker::new(
        queue,
        receiver,
        Arc::clone(&orchestrator),
        Backoff::default(),
    );
    let task_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            task_worker.run(shutdown_rx).await;
        }
    });

    let refresh_worker = RefreshWorker::new(Arc::clone(&orchestrator), config.refresh_interval);
    let refresh_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            refresh_worker.run(shutdown_rx).await;
        }
    });

    let state = AppState::new(orchestrator, config.task_token.clone());
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, task_handle).await {
        warn!(error = %e, "Task worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, refresh_handle).await {
        warn!(error = %e, "Refresh worker did not shut down in time");
    }

    info!("Control plane shutdown complete");
    Ok(())
}
