//! halyard
//!
//! Framework scheduler that keeps a k3s server and a pool of k3s agents
//! running on a cluster resource manager, and serves the admin API used to
//! scale them.

use std::sync::Arc;

use anyhow::{Context, Result};
use halyard_scheduler::{
    api::{self, ApiState},
    config::Config,
    connection::{ConnectionManager, MasterClient},
    context::SchedulerContext,
    dispatch::EventDispatcher,
    offers::OfferEvaluator,
    scale::ScaleController,
    state::{KvStore, SqliteKv},
    supervisor::Supervisor,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to HALYARD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting halyard scheduler");
    info!(
        framework = %config.framework_name,
        master = %config.master_url,
        listen_addr = %config.listen_addr,
        "Configuration loaded"
    );

    // Open the key-value store
    let kv: Arc<dyn KvStore> = if config.store_path == ":memory:" {
        warn!("Using an in-memory store; state will not survive a restart");
        Arc::new(SqliteKv::open_in_memory()?)
    } else {
        Arc::new(
            SqliteKv::open(&config.store_path)
                .with_context(|| format!("opening store at {}", config.store_path))?,
        )
    };

    let listen_addr = config.listen_addr;
    let resubscribe_interval = config.resubscribe_interval;

    let ctx = match SchedulerContext::restore(config, kv).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "Failed to restore scheduler state");
            return Err(e.into());
        }
    };
    let snapshot = ctx.snapshot().await;
    info!(
        framework_id = ?ctx.framework_id().await,
        revision = snapshot.revision,
        servers = snapshot.scale.servers,
        agents = snapshot.scale.agents,
        agent_max = snapshot.scale.agent_max,
        "Scheduler state restored"
    );

    // Wire the scheduler
    let client = MasterClient::new(ctx.config())?;
    let scale = ScaleController::new(ctx.clone());
    let dispatcher = EventDispatcher::new(ctx.clone(), OfferEvaluator::new(ctx.clone()), scale.clone());
    let manager = Arc::new(ConnectionManager::new(ctx.clone(), client, dispatcher));
    let supervisor = Supervisor::new(manager, resubscribe_interval);

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            supervisor.run(shutdown_rx).await;
        }
    });

    // Build and run the admin API
    let app = api::create_router(ApiState::new(ctx, scale)?);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "Listening for connections");

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

    // Signal shutdown to the supervisor
    let _ = shutdown_tx.send(true);

    info!("Waiting for the subscription to close...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, supervisor_handle).await {
        warn!(error = %e, "Supervisor did not shut down in time");
    }

    info!("halyard shutdown complete");
    Ok(())
}
