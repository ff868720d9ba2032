use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tracing::{info, warn};
use tts_core::{SynthesisDriver, Voice};

use server::{app, config::ServerConfig, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting synthesis server...");

    let config = ServerConfig::from_env();
    info!(
        "Server configuration loaded: port={}, rate_limit={}/min, timeout={}s, auth={}",
        config.port,
        config.rate_limit_per_minute,
        config.request_timeout_secs,
        config.auth_token.is_some()
    );

    info!("Loading voice from {}", config.engine.config_path.display());
    let engine = config.engine.clone();
    let driver = tokio::task::spawn_blocking(move || -> anyhow::Result<SynthesisDriver> {
        let voice = Voice::load(&engine)?;
        Ok(SynthesisDriver::new(voice, engine.worker_threads)?)
    })
    .await??;
    let driver = Arc::new(driver);
    info!(
        "Voice ready: sample_rate={}, speakers={}",
        driver.sample_rate(),
        driver.voice_config().model.num_speakers
    );

    let state = AppState::new(driver.clone(), config.clone());
    let app = app(state)?;

    let addr: SocketAddr = config.listen_addr().parse()?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT.")
    })?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Wakes any synthesis still blocked on a decoder context.
    driver.shutdown();
    info!("Server shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
