//! Control plane: session CRUD over HTTP, device-flow auth, machine
//! provisioning, quota gating, and billing.

mod billing;
mod config;
mod error;
mod fly;
mod identity;
mod routes;
mod state;

use anyhow::{Context, Result};
use catty_store::Store;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::ApiConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ApiConfig::from_env()?;
    let store = Store::connect(&config.database_url)
        .await
        .context("connect to database")?;

    let state = AppState::new(&config, store);
    let router = routes::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .context("bind api listener")?;
    info!(
        addr = %config.listen_addr,
        exec_app = %config.exec_app,
        billing = config.stripe.is_some(),
        "api server listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("api server error")?;

    info!("api server stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!("shutdown signal received, draining requests");
}
