//! Bucket Cache server
//!
//! Serves the cache over HTTP, keeps the reverse index reconciled and runs
//! the garbage collector for this application.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bucket_cache::api::{create_router, AppState};
use bucket_cache::gc::SystemLoadProbe;
use bucket_cache::{
    spawn_collector, spawn_expiry_task, spawn_reconciler, Config, GarbageCollector, Keyspace,
    StorageEngine,
};

/// Main entry point for the Bucket Cache server.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load and validate configuration from environment variables
/// 3. Create the keyspace and start active expiration
/// 4. Create the storage engine and start the reconciler
/// 5. Start the garbage collector, if enabled
/// 6. Start HTTP server on configured port
/// 7. Handle graceful shutdown on SIGINT/SIGTERM, releasing the GC lease
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bucket_cache=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Bucket Cache Server");

    let config = Config::from_env().context("Invalid configuration")?;
    config.validate().context("Invalid configuration")?;
    info!(
        app = %config.app_name,
        env = %config.environment,
        port = config.server_port,
        cache_enabled = config.cache_enabled,
        gc_enabled = config.gc.enabled,
        "Configuration loaded"
    );

    let keyspace = Arc::new(Keyspace::new());
    let expiry_handle = spawn_expiry_task(
        keyspace.clone(),
        Duration::from_millis(config.expiry_interval_ms.max(1)),
    );

    let engine = StorageEngine::from_config(keyspace.clone(), &config);
    let reconciler_handle = spawn_reconciler(engine.clone(), engine.notifications().subscribe());

    let mut state = AppState::new(engine);
    let collector = if config.gc.enabled {
        let gc = GarbageCollector::from_config(
            keyspace.clone(),
            &config,
            Arc::new(SystemLoadProbe::new()),
        );
        let handle = spawn_collector(gc);
        state = state.with_gc_state(handle.state());
        Some(handle)
    } else {
        info!("Garbage collector disabled");
        None
    };

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(collector) = collector {
        collector.shutdown().await;
    }
    reconciler_handle.abort();
    expiry_handle.abort();
    info!("Background tasks stopped");

    info!("Server shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(error = %error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
