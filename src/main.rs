use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use ytsig::config::Config;
use ytsig::metrics::Metrics;
use ytsig::server::{self, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // 1. Load config (it drives logging setup, so it comes first)
    let config = Config::from_env();

    // 2. Init logging
    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        "[init] {} v{} starting on {}:{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config.host,
        config.port
    );
    if config.auth_enabled() {
        tracing::info!("[init] API token auth is enabled");
    } else {
        tracing::warn!("[init] no API token configured, auth is disabled");
    }

    // 3. Wire the pipeline
    let metrics = Metrics::new();
    let state = AppState::new(config.clone(), Arc::clone(&metrics))?;

    // 4. Evict stale player scripts and publish the survivor count
    let survivors = state
        .resolvers
        .registry()
        .player_store()
        .init_cleanup()?;
    tracing::info!(
        "[init] player store ready at {} ({} scripts)",
        config.player_cache_dir.display(),
        survivors
    );

    // 5. Background sweeps (cache expiry, rate-limit buckets, RSS sampling)
    let _background = state.spawn_background_tasks();
    metrics.sample_memory();

    // 6. Serve until ctrl-c
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let listener =
        tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    tracing::info!("[init] listening on {}", listener.local_addr()?);

    let server_state = Arc::clone(&state);
    let server_task = tokio::spawn(async move {
        if let Err(e) = server::run(server_state, listener, shutdown_rx).await {
            tracing::error!("[http] server error: {e}");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("received SIGINT, shutting down...");
    let _ = shutdown_tx.send(true);
    let _ = server_task.await;
    tracing::info!("shutdown complete");
    Ok(())
}
