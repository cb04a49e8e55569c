//! Per-instance executor: hosts one pty-wrapped child process and relays
//! bytes to and from connected clients over a framed WebSocket.

use anyhow::{Context, Result};
use catty_exec::config::ExecConfig;
use catty_exec::server::{self, ExecState};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ExecConfig::from_env();
    info!(addr = %config.listen_addr, command = ?config.command, "executor starting");

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .context("bind executor listener")?;
    let router = server::router(ExecState::new(config)).layer(TraceLayer::new_for_http());

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("executor server error")?;

    info!("executor stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!("shutdown signal received, draining connections");
}
