//! Token-metering reverse proxy. Forwards each session's Anthropic calls
//! upstream, gates them on the owner's quota, and records token usage as a
//! side channel.

mod config;
mod proxy;
mod sse;

use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::header::HeaderValue;
use axum::routing::{any, get};
use axum::Router;
use catty_store::Store;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::ProxyConfig;
use crate::proxy::ProxyState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ProxyConfig::from_env()?;
    let store = Store::connect(&config.database_url)
        .await
        .context("connect to database")?;

    let state = ProxyState {
        store,
        http: reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("build upstream client")?,
        upstream_base: config.upstream_base.clone(),
        api_key: HeaderValue::from_str(&config.anthropic_key)
            .context("ANTHROPIC_API_KEY contains invalid header characters")?,
    };

    let router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/s/*rest", any(proxy::handle))
        .fallback(proxy::reject_unknown_path)
        .with_state(state)
        // Long enough for a full streaming completion.
        .layer(TimeoutLayer::new(Duration::from_secs(120)))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .context("bind proxy listener")?;
    info!(addr = %config.listen_addr, upstream = %config.upstream_base, "proxy listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("proxy server error")?;

    info!("proxy stopped");
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
