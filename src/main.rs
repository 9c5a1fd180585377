mod accounts;
mod admin;
mod api;
mod auth;
mod board;
mod chat;
mod config;
mod energy;
mod error;
mod friends;
mod game;
mod hub;
mod matchmaking;
mod rate_limit;
mod store;
mod types;
mod ws;

use std::net::SocketAddr;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::store::Store;

// ─── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .init();

    config::init()?;

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .context("Invalid PORT")?;

    let base_url = std::env::var("BASE_URL")
        .unwrap_or_else(|_| format!("http://localhost:{}", port));

    let server_config = config::load_server_config()?;
    let store = Store::load(config::data_path())?;

    let state = AppState::new(store.clone(), server_config, base_url);

    tokio::spawn(store.clone().flush_task());
    tokio::spawn(matchmaking::sweep_task(state.clone()));
    tokio::spawn(state.limiter.clone().prune_task());

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;

    tracing::info!("TicTacRush server running on port {}", port);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    store.save().await.context("Failed to persist store on shutdown")?;
    tracing::info!("Store saved, bye");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
