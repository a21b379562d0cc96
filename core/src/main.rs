/// ChatMirror - main entry point
use chatmirror_core::bridge::OsaScriptBridge;
use chatmirror_core::messenger_api;
use chatmirror_core::refresh::RefreshEngine;
use chatmirror_core::{Config, Mirror};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    // Initialize tracing
    let default_level = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level))
        )
        .init();

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    info!("Mirroring chat log at {}", config.db_path.display());
    info!("   Poll interval: {}ms", config.poll_interval.as_millis());
    info!("   Attachments:   {}", config.attachments_dir.display());

    let mirror = Arc::new(Mirror::new(&config, Arc::new(OsaScriptBridge::default())));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // First tick fires immediately, so this also performs the startup scan
    let engine = RefreshEngine::new(mirror.clone(), &config);
    let engine_handle = tokio::spawn(engine.run(shutdown_rx.clone()));

    let api_handle = {
        let mirror = mirror.clone();
        let addr = config.listen_addr;
        let dir = config.attachments_dir.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = messenger_api::start_messenger_api(mirror, addr, dir, shutdown).await {
                error!("Messenger API failed: {}", e);
            }
        })
    };

    wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(engine_handle, api_handle);
    info!("Stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
        info!("SIGTERM received");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
