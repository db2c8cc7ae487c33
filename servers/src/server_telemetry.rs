use anyhow::Result;
use tokio::signal;

mod telemetry_logic;
use telemetry_logic::{config, downstream, logger, monitor, state};

async fn wait_for_terminate() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
                tracing::info!("SIGTERM received, initiating shutdown.");
            }
            Err(e) => {
                tracing::warn!("Could not install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        // On non-unix platforms, just wait forever.
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before clap reads the environment
    dotenvy::dotenv().ok();

    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = config::load_config();
    let _log_guard = logger::setup_logging(&config.log_dir(), &config.log_level())?;

    let app_state = state::AppState::build(&config).await?;
    tracing::info!(
        "Telemetry gateway starting on port {} with the {} store.",
        config.port(),
        app_state.store_kind()
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let downstream_handle = tokio::spawn(downstream::run(
        config.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    let monitor_handle = tokio::spawn(monitor::run(
        config.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = wait_for_terminate() => {}
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    let (downstream_result, monitor_result) = tokio::join!(downstream_handle, monitor_handle);
    match downstream_result {
        Ok(Err(e)) => tracing::error!("Downstream server failed: {}", e),
        Err(e) => tracing::error!("Downstream task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = monitor_result {
        tracing::error!("Monitor task panicked: {}", e);
    }

    // Flush whatever is still debouncing before exit
    app_state.core.scheduler.shutdown().await;

    tracing::info!("Shutdown complete.");
    Ok(())
}
